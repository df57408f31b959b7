//! Group membership state machine.
//!
//! ```text
//!            create_group                 join_group (accepted)
//!   None ─────────────────▶ Creator   None ─────────────────────▶ Participant
//! ```
//!
//! The engine always owns the discovery (broadcast) channel and, once it is
//! in a group, exactly one multicast channel. Two receive loops run beside
//! the caller:
//!
//! - the discovery loop queues join requests (creator only) and hands join
//!   responses to an in-progress [`MembershipEngine::join_group`];
//! - the group loop decodes chat messages and surfaces them as
//!   [`GroupEvent::Message`].
//!
//! Every state change goes through `&mut self`, so the borrow checker
//! serializes `create_group`, `join_group` and `process_join_requests`. The
//! discovery loop only sees a read-only [`watch`] snapshot of role and group.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, trace};
use tokio::sync::{mpsc, watch};

use crate::channel::{is_multicast, Channel, Datagram};
use crate::codec::{classify_discovery, Codec, DiscoveryDatagram, JsonCodec};
use crate::config::EngineConfig;
use crate::error::{GroupChatError, Result};
use crate::messages::{
    ChatMessage, GroupEvent, GroupId, JoinRequest, JoinResponse, ReceivedMessage, Username,
};
use crate::queue::{JoinRequestQueue, PendingJoinRequest};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    None,
    Creator,
    Participant,
}

/// Outcome of one pending request handled by
/// [`MembershipEngine::process_join_requests`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinDecision {
    pub request: JoinRequest,
    pub from: SocketAddr,
    pub accepted: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Membership {
    role: Role,
    group_id: Option<GroupId>,
}

impl Membership {
    fn none() -> Self {
        Membership {
            role: Role::None,
            group_id: None,
        }
    }
}

struct Group {
    id: GroupId,
    endpoint: SocketAddrV4,
    channel: Channel,
}

type ResponseSender = mpsc::UnboundedSender<(JoinResponse, SocketAddr)>;

/// Slot for the single outstanding join handshake.
#[derive(Clone, Default)]
struct ResponseWaiter(Arc<Mutex<Option<ResponseSender>>>);

impl ResponseWaiter {
    fn slot(&self) -> MutexGuard<'_, Option<ResponseSender>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self) -> (WaiterRegistration, mpsc::UnboundedReceiver<(JoinResponse, SocketAddr)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot() = Some(tx);
        (WaiterRegistration(self.clone()), rx)
    }

    fn is_registered(&self) -> bool {
        self.slot().is_some()
    }
}

/// Clears the waiter slot when the handshake ends, including when the
/// `join_group` future is dropped mid-wait.
struct WaiterRegistration(ResponseWaiter);

impl Drop for WaiterRegistration {
    fn drop(&mut self) {
        self.0.slot().take();
    }
}

/// Everything the discovery receive loop needs, detached from the engine.
struct DiscoveryDispatch<C> {
    username: Username,
    codec: Arc<C>,
    membership: watch::Receiver<Membership>,
    pending: Arc<JoinRequestQueue>,
    waiter: ResponseWaiter,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl<C: Codec> DiscoveryDispatch<C> {
    fn handle(&self, datagram: Datagram) {
        match classify_discovery(&*self.codec, &datagram.data) {
            Some(DiscoveryDatagram::Request(request)) => self.on_request(request, datagram.source),
            Some(DiscoveryDatagram::Response(response)) => self.on_response(response, datagram.source),
            None => trace!("dropping unrecognized datagram from {}", datagram.source),
        }
    }

    fn on_request(&self, request: JoinRequest, from: SocketAddr) {
        if request.username == self.username {
            trace!("ignoring our own join request for '{}'", request.group_id);
            return;
        }

        {
            let membership = self.membership.borrow();
            if membership.group_id.as_deref() != Some(request.group_id.as_str()) {
                debug!(
                    "ignoring join request from {} for unknown group '{}'",
                    request.username, request.group_id
                );
                return;
            }
            if membership.role != Role::Creator {
                debug!(
                    "ignoring join request from {}: not the creator of '{}'",
                    request.username, request.group_id
                );
                return;
            }
        }

        info!("join request from {} ({}) for '{}'", request.username, from, request.group_id);
        let count = self.pending.enqueue(PendingJoinRequest { request, from });
        let _ = self.events.send(GroupEvent::JoinRequestsPending { count });
    }

    fn on_response(&self, response: JoinResponse, from: SocketAddr) {
        match self.waiter.slot().as_ref() {
            Some(tx) => {
                let _ = tx.send((response, from));
            }
            None => trace!(
                "no join in progress, dropping response for '{}' from {}",
                response.group_id,
                from
            ),
        }
    }
}

fn dispatch_chat<C: Codec>(
    codec: &C,
    group_id: &str,
    events: &mpsc::UnboundedSender<GroupEvent>,
    datagram: Datagram,
) {
    let Some(message) = codec.decode::<ChatMessage>(&datagram.data) else {
        trace!("dropping non-chat datagram from {} on '{}'", datagram.source, group_id);
        return;
    };
    let _ = events.send(GroupEvent::Message(ReceivedMessage {
        group_id: group_id.to_string(),
        username: message.username,
        text: message.text,
        sent_at: message.sent_at,
        from: datagram.source,
    }));
}

pub struct MembershipEngine<C: Codec = JsonCodec> {
    username: Username,
    config: EngineConfig,
    codec: Arc<C>,
    role: Role,
    group: Option<Group>,
    broadcast: Channel,
    membership: watch::Sender<Membership>,
    pending: Arc<JoinRequestQueue>,
    waiter: ResponseWaiter,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl MembershipEngine<JsonCodec> {
    /// Open the discovery channel and start listening on it.
    ///
    /// Chat messages and join-request notifications arrive on the returned
    /// receiver.
    pub fn new(
        username: Username,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>)> {
        Self::with_codec(username, config, JsonCodec)
    }
}

impl<C: Codec> MembershipEngine<C> {
    pub fn with_codec(
        username: Username,
        config: EngineConfig,
        codec: C,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>)> {
        let broadcast = Channel::open(config.broadcast_channel())?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (membership, membership_rx) = watch::channel(Membership::none());
        let codec = Arc::new(codec);
        let pending = Arc::new(JoinRequestQueue::new());
        let waiter = ResponseWaiter::default();

        let dispatch = DiscoveryDispatch {
            username: username.clone(),
            codec: Arc::clone(&codec),
            membership: membership_rx,
            pending: Arc::clone(&pending),
            waiter: waiter.clone(),
            events: events.clone(),
        };
        broadcast.start_receiving(move |datagram| dispatch.handle(datagram))?;

        info!("{} listening for discovery on {}", username, broadcast.local_addr());

        let engine = MembershipEngine {
            username,
            config,
            codec,
            role: Role::None,
            group: None,
            broadcast,
            membership,
            pending,
            waiter,
            events,
        };
        Ok((engine, events_rx))
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group.as_ref().map(|group| group.id.as_str())
    }

    pub fn group_endpoint(&self) -> Option<SocketAddrV4> {
        self.group.as_ref().map(|group| group.endpoint)
    }

    pub fn is_group_participant(&self) -> bool {
        self.role != Role::None
    }

    pub fn broadcast_local_addr(&self) -> SocketAddr {
        self.broadcast.local_addr()
    }

    pub fn pending_join_requests(&self) -> usize {
        self.pending.len()
    }

    /// Claim `group_id` on `multicast_address:port` and become its creator.
    ///
    /// Calling this while already in a group replaces that group.
    pub fn create_group(
        &mut self,
        group_id: impl Into<GroupId>,
        multicast_address: Ipv4Addr,
        port: u16,
    ) -> Result<SocketAddrV4> {
        if !is_multicast(multicast_address.into()) {
            return Err(GroupChatError::InvalidAddress(multicast_address.into()));
        }
        let endpoint = SocketAddrV4::new(multicast_address, port);
        self.enter_group(Role::Creator, group_id.into(), endpoint)?;
        Ok(endpoint)
    }

    /// Ask the creator of `group_id` to let us in, waiting at most `timeout`.
    ///
    /// Responses for other groups are ignored. Dropping the returned future
    /// abandons the handshake; a response arriving afterwards is discarded.
    /// On timeout or denial the engine keeps its previous state.
    pub async fn join_group(
        &mut self,
        group_id: impl Into<GroupId>,
        timeout: Duration,
    ) -> Result<SocketAddrV4> {
        let group_id = group_id.into();

        // Register before sending so a fast reply cannot slip past.
        let (registration, mut responses) = self.waiter.register();

        let request = JoinRequest::new(self.username.clone(), group_id.clone());
        self.broadcast
            .send_to_destination(&self.codec.encode(&request)?)
            .await?;
        info!("requested to join '{}' via {}", group_id, self.broadcast.destination());

        let wait = async {
            while let Some((response, from)) = responses.recv().await {
                if response.group_id != group_id {
                    debug!("ignoring join response for '{}' from {}", response.group_id, from);
                    continue;
                }
                if response.is_success() && response.group_endpoint().is_none() {
                    debug!("ignoring success response without endpoint from {}", from);
                    continue;
                }
                return Some((response, from));
            }
            None
        };
        let outcome = tokio::time::timeout(timeout, wait).await;
        drop(registration);

        let Ok(Some((response, from))) = outcome else {
            info!("join request for '{}' timed out after {:?}", group_id, timeout);
            return Err(GroupChatError::JoinTimeout { group_id, timeout });
        };

        let Some(endpoint) = response.group_endpoint() else {
            info!("join request for '{}' denied by {}", group_id, from);
            return Err(GroupChatError::JoinDenied { group_id });
        };

        self.enter_group(Role::Participant, group_id, endpoint)?;
        Ok(endpoint)
    }

    /// Resolve every queued join request, oldest first.
    ///
    /// `decide` is called once per request; each answer is broadcast before
    /// the next request is considered. Accepted joiners are also announced
    /// to the group. Does nothing unless this engine created its group.
    ///
    /// If a send fails, the requests not yet decided go back to the front of
    /// the queue and the error is returned.
    pub async fn process_join_requests<D>(&mut self, mut decide: D) -> Result<Vec<JoinDecision>>
    where
        D: FnMut(&JoinRequest, SocketAddr) -> bool,
    {
        let Some(group) = self.group.as_ref().filter(|_| self.role == Role::Creator) else {
            return Ok(Vec::new());
        };

        let mut decisions = Vec::new();
        let mut drained = self.pending.try_dequeue_all().into_iter();
        while let Some(PendingJoinRequest { request, from }) = drained.next() {
            if request.group_id != group.id {
                debug!("dropping stale join request from {} for '{}'", request.username, request.group_id);
                continue;
            }

            let accepted = decide(&request, from);
            if let Err(e) = self.answer(group, &request, accepted).await {
                let undecided: Vec<PendingJoinRequest> = drained.collect();
                error!(
                    "failed to answer join request from {} ({}): {}; {} undecided request(s) requeued",
                    request.username,
                    from,
                    e,
                    undecided.len()
                );
                self.pending.requeue_front(undecided);
                return Err(e);
            }

            info!(
                "{} join request from {} ({})",
                if accepted { "accepted" } else { "denied" },
                request.username,
                from
            );
            decisions.push(JoinDecision {
                request,
                from,
                accepted,
            });
        }

        Ok(decisions)
    }

    async fn answer(&self, group: &Group, request: &JoinRequest, accepted: bool) -> Result<()> {
        let response = if accepted {
            JoinResponse::accept(group.id.clone(), group.endpoint)
        } else {
            JoinResponse::deny(group.id.clone())
        };
        self.broadcast
            .send_to_destination(&self.codec.encode(&response)?)
            .await?;

        if accepted {
            let announcement = ChatMessage::new(
                self.username.clone(),
                format!("{} joined {}", request.username, group.id),
            );
            group
                .channel
                .send_to_destination(&self.codec.encode(&announcement)?)
                .await?;
        }
        Ok(())
    }

    /// Multicast `text` to the group. Without a group this does nothing.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let Some(group) = &self.group else {
            return Ok(());
        };
        let message = ChatMessage::new(self.username.clone(), text);
        group
            .channel
            .send_to_destination(&self.codec.encode(&message)?)
            .await
    }

    /// Close the group and discovery channels. The engine cannot be reused.
    pub fn close(&mut self) {
        if let Some(group) = self.group.take() {
            group.channel.close();
        }
        self.broadcast.close();
        self.pending.clear();
        self.set_membership(Role::None, None);
    }

    fn enter_group(&mut self, role: Role, group_id: GroupId, endpoint: SocketAddrV4) -> Result<()> {
        // The new channel is opened before the old one is released so a
        // failed open leaves the current group untouched.
        let channel = Channel::open(self.config.multicast_channel(endpoint))?;
        let codec = Arc::clone(&self.codec);
        let events = self.events.clone();
        let chat_group = group_id.clone();
        channel.start_receiving(move |datagram| dispatch_chat(&*codec, &chat_group, &events, datagram))?;

        if let Some(previous) = self.group.take() {
            info!("leaving '{}' on {}", previous.id, previous.endpoint);
            previous.channel.close();
        }

        // Requests queued for a previous group are void.
        self.pending.clear();

        info!("{} is now {:?} of '{}' on {}", self.username, role, group_id, endpoint);
        self.set_membership(role, Some(group_id.clone()));
        self.group = Some(Group {
            id: group_id,
            endpoint,
            channel,
        });
        Ok(())
    }

    fn set_membership(&mut self, role: Role, group_id: Option<GroupId>) {
        self.role = role;
        self.membership.send_replace(Membership { role, group_id });
    }
}
