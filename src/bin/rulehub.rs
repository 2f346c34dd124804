//! rulehub CLI
//!
//! Loads a settings file holding registry settings and a snapshot of rule
//! keys, builds the session registry, and optionally executes one session.

use std::path::PathBuf;

use rulehub::{InMemoryConfigSource, JsonRuleCompiler, RegistryConfig, SessionRegistry};

/// CLI options
struct Options {
    /// Settings file (`[registry]` and `[namespaces.*]` tables)
    config: PathBuf,
    /// Session to execute
    rule: Option<String>,
    /// JSON facts passed to the session
    facts: String,
    /// Print loaded sessions
    list: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            config: PathBuf::from("rulehub.toml"),
            rule: None,
            facts: "{}".to_string(),
            list: false,
        }
    }
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    options.config = PathBuf::from(&args[i + 1]);
                    i += 2;
                } else {
                    eprintln!("error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "--rule" | "-r" => {
                if i + 1 < args.len() {
                    options.rule = Some(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("error: --rule requires a value");
                    std::process::exit(1);
                }
            }
            "--facts" | "-f" => {
                if i + 1 < args.len() {
                    options.facts = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("error: --facts requires a value");
                    std::process::exit(1);
                }
            }
            "--list" | "-l" => {
                options.list = true;
                i += 1;
            }
            "--help" | "-h" => {
                println!("rulehub - hot-reloadable rule sessions");
                println!();
                println!("USAGE:");
                println!("    rulehub [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -c, --config <FILE>       Settings file [default: rulehub.toml]");
                println!("    -r, --rule <NAME>         Session to execute");
                println!("    -f, --facts <JSON>        Facts for the session [default: {{}}]");
                println!("    -l, --list                List loaded sessions");
                println!("    -h, --help                Print help information");
                std::process::exit(0);
            }
            arg => {
                eprintln!("error: unknown argument: {arg}");
                std::process::exit(1);
            }
        }
    }

    options
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = parse_args();

    let text = std::fs::read_to_string(&options.config)
        .map_err(|e| format!("cannot read {}: {e}", options.config.display()))?;
    let config = RegistryConfig::from_toml_str(&text)?;
    let source = InMemoryConfigSource::from_toml_str(&text)?.with_channel_capacity(config.change_queue_capacity);

    let registry = SessionRegistry::bootstrap(JsonRuleCompiler, &config, &source)?;

    if options.list {
        for name in registry.names() {
            if let Some(info) = registry.entry_info(&name) {
                println!("{name}\t{}\trev {}\t{}", info.key, info.revision, info.loaded_at.to_rfc3339());
            }
        }
    }

    if let Some(rule) = options.rule {
        let facts: serde_json::Value =
            serde_json::from_str(&options.facts).map_err(|e| format!("invalid --facts JSON: {e}"))?;
        let session = registry.lookup(&rule)?;
        let outcome = session.execute(&facts);
        let rendered = serde_json::json!({
            "session": rule,
            "fired": outcome.fired,
            "output": outcome.output,
        });
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    }

    Ok(())
}
