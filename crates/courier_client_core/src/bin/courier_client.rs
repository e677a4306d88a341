#![forbid(unsafe_code)]

use courier_client_core::{ClientConfig, DEFAULT_SERVER_ENDPOINT, RelayClient};
use courier_protocol::ServerFrame;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_client [--connect tcp://host:port] --credential token [--to identity --message text]\n\
\n\
Options:\n\
	--connect     Relay endpoint (default: tcp://127.0.0.1:8081)\n\
	--credential  Credential sent as `from` (default: $COURIER_CLIENT_CREDENTIAL)\n\
	--to          Recipient identity; with --message sends one chat message\n\
	--message     Chat text\n\
	--help        Show this help\n\
\n\
Without --to the client announces presence and prints deliveries until interrupted.\n\
\n\
Examples:\n\
	courier_client --credential alice\n\
	courier_client --credential alice --to bob --message hello\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_client_core=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	endpoint: String,
	credential: String,
	chat: Option<(String, String)>,
}

fn parse_args() -> Args {
	let mut endpoint = DEFAULT_SERVER_ENDPOINT.to_string();
	let mut credential = std::env::var("COURIER_CLIENT_CREDENTIAL")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let mut to: Option<String> = None;
	let mut message: Option<String> = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--endpoint" => endpoint = it.next().unwrap_or_else(|| usage_and_exit()),
			"--credential" => credential = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--to" => to = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			"--message" => message = Some(it.next().unwrap_or_else(|| usage_and_exit())),
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(credential) = credential else {
		eprintln!("--credential is required");
		usage_and_exit();
	};

	let chat = match (to, message) {
		(Some(to), Some(message)) => Some((to, message)),
		(None, None) => None,
		_ => {
			eprintln!("--to and --message must be given together");
			usage_and_exit();
		}
	};

	Args {
		endpoint,
		credential,
		chat,
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = ClientConfig::from_tcp_endpoint(&args.endpoint).unwrap_or_else(|e| {
		eprintln!("Invalid --connect value: {}\n{e}", args.endpoint);
		usage_and_exit();
	});
	let mut client = RelayClient::connect(cfg).await?;

	if let Some((to, message)) = args.chat {
		let reply = client.send_chat(&args.credential, &to, &message).await?;
		println!("{} {}", reply.result_code.as_u16(), reply.content);
		client.close().await?;
		return Ok(());
	}

	let reply = client.announce(&args.credential).await?;
	info!(code = reply.result_code.as_u16(), content = %reply.content, "presence announced");
	if !reply.result_code.is_success() {
		anyhow::bail!("relay refused presence: {}", reply.content);
	}

	loop {
		match client.next_frame().await? {
			ServerFrame::Delivery(d) => println!("[{}] {}", d.from, d.content),
			ServerFrame::Reply(r) => warn!(code = r.result_code.as_u16(), content = %r.content, "unexpected reply"),
		}
	}
}
