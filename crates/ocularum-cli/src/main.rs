use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ocularum_bridge::{BridgeConfig, BridgeService};
use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Default, PartialEq)]
struct Args {
    worker: Option<PathBuf>,
    client_id: Option<String>,
    client_secret: Option<String>,
    debug: bool,
    timeout: Option<Duration>,
    watch: Vec<String>,
    command: Option<String>,
    params: Option<String>,
}

fn print_usage() {
    eprintln!(
        "Usage: ocularum [--worker <path>] [--client-id <id>] [--client-secret <secret>]"
    );
    eprintln!("                [--debug] [--timeout <secs>] [--watch <topic>]...");
    eprintln!("                [<command> [<params-json>]]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <command>              Worker command to invoke, e.g. get_user_info");
    eprintln!("  <params-json>          Command parameters as a JSON object [default: {{}}]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --worker <path>        Worker executable or main.py [env: OCULARUM_WORKER]");
    eprintln!("  --client-id <id>       Client id passed to the worker [env: OCULARUM_CLIENT_ID]");
    eprintln!("  --client-secret <s>    Client secret [env: OCULARUM_CLIENT_SECRET]");
    eprintln!("  --debug                Start the worker in debug mode [env: OCULARUM_DEBUG]");
    eprintln!("  --timeout <secs>       Per-command timeout [env: OCULARUM_COMMAND_TIMEOUT_SECS]");
    eprintln!("  --watch <topic>        Print notifications for <topic> until Ctrl-C");
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--worker" => {
                i += 1;
                parsed.worker = Some(PathBuf::from(
                    args.get(i).ok_or("--worker requires a value")?,
                ));
            }
            "--client-id" => {
                i += 1;
                parsed.client_id = Some(args.get(i).ok_or("--client-id requires a value")?.clone());
            }
            "--client-secret" => {
                i += 1;
                parsed.client_secret = Some(
                    args.get(i)
                        .ok_or("--client-secret requires a value")?
                        .clone(),
                );
            }
            "--timeout" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout requires a value")?;
                let secs: f64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout value: {raw}"))?;
                if !secs.is_finite() || secs <= 0.0 {
                    return Err(format!("--timeout must be positive, got {raw}"));
                }
                parsed.timeout = Some(Duration::from_secs_f64(secs));
            }
            "--watch" => {
                i += 1;
                parsed
                    .watch
                    .push(args.get(i).ok_or("--watch requires a topic")?.clone());
            }
            "--debug" => parsed.debug = true,
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') && arg.len() > 1 => {
                return Err(format!("unknown flag: {arg}"));
            }
            arg => {
                if parsed.command.is_none() {
                    parsed.command = Some(arg.to_string());
                } else if parsed.params.is_none() {
                    parsed.params = Some(arg.to_string());
                } else {
                    return Err(format!("unexpected argument: {arg}"));
                }
            }
        }
        i += 1;
    }

    if parsed.command.is_none() && parsed.watch.is_empty() {
        return Err("nothing to do: give a <command> or at least one --watch topic".to_string());
    }
    Ok(parsed)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("OCULARUM_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "ocularum_bridge={level},ocularum_cli={level},ocularum::worker={level},ocularum::protocol=warn",
            level = base_level
        ))
    };

    // stdout carries command results and notifications; logs go to stderr.
    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");
    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn build_config(args: &Args) -> BridgeConfig {
    let mut config = BridgeConfig::from_env();
    if let Some(worker) = &args.worker {
        config = config.with_worker_path(worker);
    }
    if args.client_id.is_some() {
        config.worker.client_id = args.client_id.clone();
    }
    if args.client_secret.is_some() {
        config.worker.client_secret = args.client_secret.clone();
    }
    if args.debug {
        config = config.with_debug(true);
    }
    if args.timeout.is_some() {
        config = config.with_command_timeout(args.timeout);
    }
    config
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("<params-json> is not valid JSON"),
        None => Ok(Value::Null),
    }
}

/// Returns whether the requested command succeeded.
async fn run(service: &Arc<BridgeService>, args: &Args) -> anyhow::Result<bool> {
    let params = parse_params(args.params.as_deref())?;

    // Subscribe before initialize so notifications emitted during startup
    // are not missed.
    for topic in &args.watch {
        let label = topic.clone();
        service.subscribe(topic.clone(), move |data: &Value| {
            let line = serde_json::to_string(&json!({"topic": label, "data": data}))?;
            println!("{line}");
            Ok(())
        });
    }

    service
        .initialize()
        .await
        .context("failed to start worker")?;
    if let Some(info) = service.worker_info() {
        tracing::info!(pid = ?info.pid, generation = info.generation, "Bridge ready");
    }

    let mut succeeded = true;
    if let Some(command) = &args.command {
        match service.invoke(command, params).await {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => {
                eprintln!("error: {command} failed: {e}");
                succeeded = false;
            }
        }
    }

    if !args.watch.is_empty() {
        tracing::info!(topics = ?args.watch, "Watching notifications, press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
    }

    Ok(succeeded)
}

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            print_usage();
            process::exit(2);
        }
    };

    init_tracing();

    let service = BridgeService::new(build_config(&args));
    let outcome = run(&service, &args).await;
    // The runtime stops when main returns; wait for the worker to finish its
    // own shutdown first.
    service.shutdown_and_wait().await;

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        std::iter::once("ocularum")
            .chain(items.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_command_and_params() {
        let args = parse_args(&argv(&[
            "--worker",
            "/opt/backend/main.py",
            "--debug",
            "get_user_info",
            r#"{"username":"alice"}"#,
        ]))
        .unwrap();

        assert_eq!(args.worker, Some(PathBuf::from("/opt/backend/main.py")));
        assert!(args.debug);
        assert_eq!(args.command.as_deref(), Some("get_user_info"));
        assert_eq!(args.params.as_deref(), Some(r#"{"username":"alice"}"#));
    }

    #[test]
    fn watch_is_repeatable_and_enough_on_its_own() {
        let args = parse_args(&argv(&["--watch", "streamer_live", "--watch", "autotune_started"]))
            .unwrap();
        assert_eq!(args.watch, vec!["streamer_live", "autotune_started"]);
        assert!(args.command.is_none());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["--bogus"])).is_err());
        assert!(parse_args(&argv(&["--timeout", "-1", "x"])).is_err());
        assert!(parse_args(&argv(&["--timeout", "soon", "x"])).is_err());
        assert!(parse_args(&argv(&["a", "{}", "extra"])).is_err());
        assert!(parse_args(&argv(&["--worker"])).is_err());
    }

    #[test]
    fn timeout_accepts_fractional_seconds() {
        let args = parse_args(&argv(&["--timeout", "1.5", "get_active_streams"])).unwrap();
        assert_eq!(args.timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn params_default_to_null() {
        assert_eq!(parse_params(None).unwrap(), Value::Null);
        assert_eq!(
            parse_params(Some(r#"{"channel":"alice"}"#)).unwrap(),
            json!({"channel": "alice"})
        );
        assert!(parse_params(Some("{not json")).is_err());
    }

    #[test]
    fn flags_override_config() {
        let args = Args {
            worker: Some(PathBuf::from("/tmp/worker")),
            client_id: Some("abc".to_string()),
            debug: true,
            timeout: Some(Duration::from_secs(2)),
            command: Some("get_active_streams".to_string()),
            ..Default::default()
        };
        let config = build_config(&args);
        assert_eq!(config.worker_path, Some(PathBuf::from("/tmp/worker")));
        assert_eq!(config.worker.client_id.as_deref(), Some("abc"));
        assert!(config.worker.debug);
        assert_eq!(config.command_timeout, Some(Duration::from_secs(2)));
    }
}
