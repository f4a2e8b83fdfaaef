#![forbid(unsafe_code)]

use courier_client::{ClientConfig, ClientSession, parse_tag_changes};
use courier_protocol::{DigestAlgorithm, kind};
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_client --user u --client c --secret s [--connect ws://host:port] [--tags a,-b] [--digest md5|hmac-sha256]\n\
\n\
Options:\n\
	--connect   Node WebSocket endpoint (default: ws://127.0.0.1:8080)\n\
	--user      User id to log in as\n\
	--client    Client (device) id\n\
	--secret    Shared token secret\n\
	--tags      Tag changes: \"a,-b\" tags \"a\" and untags \"b\"\n\
	--digest    Token digest (default: md5)\n\
	--help      Show this help\n\
\n\
Pushed messages are printed and acknowledged automatically.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,courier_client=debug".to_string());
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

struct Args {
	cfg: ClientConfig,
	tags: String,
}

fn parse_args() -> Args {
	let mut endpoint = "ws://127.0.0.1:8080".to_string();
	let mut user = String::new();
	let mut client = String::new();
	let mut secret = std::env::var("COURIER_CLIENT_SECRET").unwrap_or_default();
	let mut tags = String::new();
	let mut digest = DigestAlgorithm::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--connect" | "--addr" => endpoint = value(),
			"--user" => user = value(),
			"--client" => client = value(),
			"--secret" => secret = value(),
			"--tags" => tags = value(),
			"--digest" => {
				let v = value();
				digest = v.parse().unwrap_or_else(|e| {
					eprintln!("{e}");
					usage_and_exit()
				});
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	if user.trim().is_empty() || client.trim().is_empty() || secret.is_empty() {
		eprintln!("--user, --client and --secret are required");
		usage_and_exit();
	}

	let mut cfg = ClientConfig::new(&endpoint, &user, &client, &secret).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit()
	});
	cfg.digest = digest;

	Args { cfg, tags }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let Args { cfg, tags } = parse_args();

	info!(endpoint = %cfg.endpoint.url(), user = %cfg.user, client = %cfg.client_id, "connecting");
	let mut session = ClientSession::connect_and_login(&cfg).await?;

	let changes = parse_tag_changes(&tags);
	if !changes.is_empty() {
		session.update_tags(&changes).await?;
		info!(?changes, "tags updated");
	}

	while let Some(frame) = session.next_frame().await? {
		if frame.t != kind::PUSH {
			warn!(t = %frame.t, rt = ?frame.rt, code = ?frame.c, message = ?frame.m, "non-push frame");
			continue;
		}

		let ids: Vec<String> = frame.ms.iter().map(|m| m.id.clone()).collect();
		for m in &frame.ms {
			println!("[{} @{}] {}", m.id, m.ts, m.data);
		}
		session.ack(&ids).await?;
	}

	info!("connection closed by node");
	Ok(())
}
