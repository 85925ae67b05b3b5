use std::path::PathBuf;
use std::process;

use chronicle_httpd as httpd;

mod logger {
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .finish()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = match parse_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("chronicle-httpd: {err}");
            process::exit(1);
        }
    };

    tracing::subscriber::set_global_default(logger::subscriber())
        .expect("Global logger hasn't already been set");

    tracing::info!("version {}", env!("CARGO_PKG_VERSION"));

    match httpd::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments and environment into HTTP options.
fn parse_options() -> Result<httpd::Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;
    let mut db = None;
    let mut repos = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("db") => {
                let path: PathBuf = parser.value()?.parse()?;
                db = Some(path);
            }
            Long("repos") => {
                let path: PathBuf = parser.value()?.parse()?;
                repos = Some(path);
            }
            Long("help") | Short('h') => {
                println!("usage: chronicle-httpd [--listen <addr>] [--db <path>] [--repos <dir>]..");
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(httpd::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 8080).into()),
        db: db
            .or_else(|| std::env::var("DATABASE_URL").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("chronicle.db")),
        repos: repos
            .or_else(|| std::env::var("REPOS_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("repos")),
        cors_origin: std::env::var("CORS_ORIGIN").ok(),
        sync_token: std::env::var("CHRONICLE_SYNC_TOKEN").ok(),
        session_secret: std::env::var("CHRONICLE_SESSION_SECRET").ok(),
    })
}
