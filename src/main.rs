use std::io::{self, BufRead, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::mpsc;

use lan_group_chat::{
    EngineConfig, GroupEvent, JoinRequest, MembershipEngine, ReceivedMessage, Result, Username,
    DEFAULT_DISCOVERY_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "lan-group-chat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name shown to other participants
    username: String,

    #[command(subcommand)]
    command: Command,

    /// Port used for discovery broadcasts
    #[arg(long, global = true, default_value_t = DEFAULT_DISCOVERY_PORT)]
    discovery_port: u16,

    /// Address discovery datagrams are sent to
    #[arg(long, global = true, default_value_t = Ipv4Addr::BROADCAST)]
    broadcast_address: Ipv4Addr,

    /// Local interface address; any interface when omitted
    #[arg(long, global = true)]
    local_address: Option<Ipv4Addr>,

    /// Log level (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: log::LevelFilter,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a group and decide who may join it
    Create {
        group_id: String,
        multicast_address: Ipv4Addr,
        /// Port of the multicast group [default: 9100]
        #[arg(long)]
        group_port: Option<u16>,
    },
    /// Ask the creator of a group to let you in
    Join {
        group_id: String,
        /// Seconds to wait for the creator's answer
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    if let Err(e) = run(args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let username = Username::new(args.username)?;
    let mut config = EngineConfig::new()
        .discovery_port(args.discovery_port)
        .broadcast_destination(SocketAddrV4::new(args.broadcast_address, args.discovery_port));
    if let Some(address) = args.local_address {
        config = config.local_address(address);
    }

    let (mut engine, events) = MembershipEngine::new(username, config)?;
    info!("Discovery channel listening on {}", engine.broadcast_local_addr());

    match args.command {
        Command::Create {
            group_id,
            multicast_address,
            group_port,
        } => {
            let port = group_port.unwrap_or(engine.config().group_port);
            let endpoint = engine.create_group(group_id.clone(), multicast_address, port)?;
            println!("Created group '{}' on {}", group_id, endpoint);
        }
        Command::Join {
            group_id,
            timeout_secs,
        } => {
            let timeout = timeout_secs.map_or(engine.config().join_timeout, Duration::from_secs);
            println!("Waiting for the creator of '{}' to answer...", group_id);
            match engine.join_group(group_id.clone(), timeout).await {
                Ok(endpoint) => println!("Joined '{}' on {}", group_id, endpoint),
                Err(e) if e.is_join_outcome() => {
                    println!("{}", e);
                    engine.close();
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    println!("Type a message and press Enter to send it. /quit leaves.");
    let printer = tokio::spawn(print_events(events, engine.username().clone()));
    let outcome = chat_loop(&mut engine).await;

    engine.close();
    printer.abort();
    println!("Bye.");
    outcome
}

async fn chat_loop(engine: &mut MembershipEngine) -> Result<()> {
    while let Some(line) = read_line().await? {
        let text = line.trim_end();
        if text == "/quit" {
            break;
        }
        if !text.is_empty() {
            engine.send_message(text).await?;
        }

        let decisions = engine
            .process_join_requests(|request, from| {
                tokio::task::block_in_place(|| ask_to_accept(request, from))
            })
            .await?;
        for decision in decisions {
            let verdict = if decision.accepted { "accepted" } else { "denied" };
            println!("{} {}", verdict, decision.request.username);
        }
    }
    Ok(())
}

async fn read_line() -> io::Result<Option<String>> {
    tokio::task::spawn_blocking(|| -> io::Result<Option<String>> {
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        Ok((read > 0).then_some(line))
    })
    .await
    .map_err(io::Error::other)?
}

fn ask_to_accept(request: &JoinRequest, from: SocketAddr) -> bool {
    print!("Accept {} from {}? [Y/n] ", request.username, from.ip());
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(0) | Err(_) => false,
        Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes"),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<GroupEvent>, me: Username) {
    while let Some(event) = events.recv().await {
        match event {
            GroupEvent::Message(message) if message.username == me => {}
            GroupEvent::Message(message) => print_message(&message),
            GroupEvent::JoinRequestsPending { count } => {
                println!("[{} join request(s) pending, press Enter to review]", count);
            }
        }
    }
}

fn print_message(message: &ReceivedMessage) {
    println!("===");
    println!("** {} **", message.group_id);
    println!(" {} ({})", message.username, message.from.ip());
    println!(" {}", message.text);
    println!("\t{}", message.sent_at.with_timezone(&Local).format("%H:%M"));
    println!("===");
}
