use std::env;

use corral_types::SyncSnapshot;

mod scenarios;

type AnyResult<T> = Result<T, String>;

struct Args {
    list: bool,
    requested: Option<String>,
}

type Scenario = fn() -> AnyResult<SyncSnapshot>;

const SCENARIOS: &[(&str, Scenario)] = &[
    ("moderator_starvation", scenarios::moderator_starvation::run),
    ("nb_chan_backlog", scenarios::nb_chan_backlog::run),
    ("slow_invocation", scenarios::slow_invocation::run),
    ("win_or_waiter_crowd", scenarios::win_or_waiter_crowd::run),
];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> AnyResult<()> {
    let args = parse_args()?;

    if args.list {
        for (name, _) in SCENARIOS {
            println!("{name}");
        }
        return Ok(());
    }

    let selected: Vec<&(&str, Scenario)> = match &args.requested {
        Some(requested) => vec![resolve_requested(requested)?],
        None => SCENARIOS.iter().collect(),
    };

    for (name, scenario) in selected {
        tracing::info!(scenario = name, "running");
        let snapshot = scenario()?;
        let json = facet_json::to_string(&snapshot);
        println!("{json}");
    }
    Ok(())
}

fn parse_args() -> AnyResult<Args> {
    let mut list = false;
    let mut requested: Option<String> = None;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--list" => {
                list = true;
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            _ if arg.starts_with('-') => {
                return Err(format!("Unknown option '{arg}'"));
            }
            _ => {
                if requested.is_some() {
                    return Err("Too many arguments".to_owned());
                }
                requested = Some(arg);
            }
        }
    }

    Ok(Args { list, requested })
}

fn print_help() {
    eprintln!("Usage: corral-examples [--list] [scenario-name]");
}

fn resolve_requested(requested: &str) -> AnyResult<&'static (&'static str, Scenario)> {
    if let Some(exact) = SCENARIOS.iter().find(|(name, _)| *name == requested) {
        return Ok(exact);
    }

    let needle = requested.to_lowercase();
    if let Some(close) = SCENARIOS.iter().find(|(name, _)| name.contains(&needle)) {
        eprintln!("Using closest scenario match '{}' for '{requested}'.", close.0);
        return Ok(close);
    }

    eprintln!("Unknown scenario '{requested}'. Available scenarios:");
    for (name, _) in SCENARIOS {
        eprintln!("{name}");
    }
    Err("No matching scenario found".to_owned())
}
