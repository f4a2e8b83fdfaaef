#![forbid(unsafe_code)]

use courier_client::admin::AdminClient;
use courier_protocol::DigestAlgorithm;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: courier_admin --secret s --msg text [--addr http://host:port] [--users a,b] [--tags x,y]\n\
\n\
Options:\n\
	--addr      Node admin endpoint (default: http://127.0.0.1:8081)\n\
	--secret    Admin signing secret\n\
	--users     Comma separated recipient user ids\n\
	--tags      Comma separated recipient tags\n\
	--msg       Message payload\n\
	--digest    Signature digest (default: md5)\n\
	--help      Show this help\n"
	);
	std::process::exit(2)
}

fn split_list(s: &str) -> Vec<String> {
	s.split(',')
		.map(str::trim)
		.filter(|v| !v.is_empty())
		.map(str::to_string)
		.collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()))
		.with_target(false)
		.init();

	let mut addr = "http://127.0.0.1:8081".to_string();
	let mut secret = std::env::var("COURIER_ADMIN_SECRET").unwrap_or_default();
	let mut users = String::new();
	let mut tags = String::new();
	let mut msg: Option<String> = None;
	let mut digest = DigestAlgorithm::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		let mut value = || it.next().unwrap_or_else(|| usage_and_exit());
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--addr" => addr = value(),
			"--secret" => secret = value(),
			"--users" => users = value(),
			"--tags" => tags = value(),
			"--msg" => msg = Some(value()),
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

	let Some(msg) = msg else {
		eprintln!("--msg is required");
		usage_and_exit();
	};
	if secret.is_empty() {
		eprintln!("--secret is required");
		usage_and_exit();
	}

	let client = AdminClient::new(&addr, &secret)?.with_digest(digest);
	let resp = client.publish(&split_list(&users), &split_list(&tags), &msg).await?;
	println!("{} {}", resp.code, resp.data);
	Ok(())
}
