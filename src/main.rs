use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use kestrel::events::Event;
use kestrel::ext::ExtManager;
use kestrel::options::{load_paths, OptManager, TypeSpec};
use kestrel::Result;

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Typed options registry and extension host", long_about = None)]
#[command(version)]
struct Cli {
    /// Set an option, in the format `option[=value]`. May be repeated.
    #[arg(short, long, value_name = "option[=value]")]
    set: Vec<String>,
}

fn default_confdir() -> String {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kestrel")
        .display()
        .to_string()
}

/// Register the options the host itself depends on.
fn builtin_options(options: &mut OptManager) -> Result<()> {
    options.add_option(
        "confdir",
        TypeSpec::Str,
        Value::String(default_confdir()),
        "Location of the configuration directory.",
        None,
    )
}

async fn run(cli: Cli) -> Result<()> {
    let options = Rc::new(RefCell::new(OptManager::new()));
    builtin_options(&mut options.borrow_mut())?;

    // Command-line values take effect first so the config path itself can
    // be overridden; values for options that extensions declare later are
    // deferred until registration.
    options.borrow_mut().set(&cli.set, true)?;

    let config_path = {
        let options = options.borrow();
        let confdir = options.get("confdir")?;
        let confdir = confdir.as_str().unwrap_or_default();
        PathBuf::from(confdir).join("options.toml")
    };
    load_paths(&mut options.borrow_mut(), [config_path], true)?;

    let manager = ExtManager::new(Rc::clone(&options));
    manager.trigger(&Event::Ready).await?;
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::process::ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            std::process::ExitCode::FAILURE
        }
    }
}
