use clap::{Parser, Subcommand};

use ravel::config::Config;
use ravel::process::{ProcessEnvironment, ProcessOutput, ProcessSpec};
use ravel::{rlog, Affinity, Result, TaskError, TaskManager};

/// Ravel - run programs through the task runtime
#[derive(Parser, Debug)]
#[command(name = "ravel")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    RAVEL_DEBUG=1   Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.ravel/ravel.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Print results as JSON instead of streaming output
    #[arg(long, global = true)]
    pub json: bool,

    /// Run the program on the exclusive scheduler
    #[arg(long, global = true)]
    pub exclusive: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a program as a task
    Run {
        /// Program to run, resolved through PATH
        program: String,

        /// Arguments passed to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Run git as a task, using the configured git path if any
    Git {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    ravel::log::init(cli.debug || config.debug);

    match cli.command {
        Command::Run { program, args } => {
            run_process(&config, ProcessSpec::new(program).args(args), cli.json, cli.exclusive)
        }
        Command::Git { args } => run_process(&config, ProcessSpec::git(args), cli.json, cli.exclusive),
        Command::Config => show_config(&config, cli.json),
    }
}

type Report = (bool, Option<TaskError>, Option<ProcessOutput>);

fn run_process(config: &Config, spec: ProcessSpec, json: bool, exclusive: bool) -> Result<()> {
    let tm = TaskManager::new(config.runtime())?
        .with_process_environment(ProcessEnvironment::from_config(config));

    let spec = if json {
        spec
    } else {
        spec.on_output(|line| println!("{}", line))
    };
    let affinity = if exclusive {
        Affinity::Exclusive
    } else {
        Affinity::Concurrent
    };

    let task = tm.process(spec).with_affinity(affinity);
    rlog!("ravel: running {} on {}", task.name(), affinity);
    let report = task.finally_with_result(
        Affinity::Ui,
        |success, error, output: Option<ProcessOutput>| -> Report { (success, error, output) },
    );
    let (success, error, output) = report.wait()?;
    tm.stop();

    if json {
        let value = match (&output, &error) {
            (Some(output), _) => serde_json::to_value(output)?,
            (None, Some(error)) => serde_json::json!({ "error": error.to_string() }),
            (None, None) => serde_json::Value::Null,
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
    }

    if success {
        return Ok(());
    }
    let code = match &error {
        Some(TaskError::ProcessFailed { code, stderr, .. }) => {
            if !json && !stderr.is_empty() {
                eprintln!("{}", stderr);
            }
            code.unwrap_or(1)
        }
        Some(other) => {
            if !json {
                eprintln!("ravel: {}", other);
            }
            1
        }
        None => 1,
    };
    std::process::exit(code);
}

fn show_config(config: &Config, json: bool) -> Result<()> {
    let runtime = config.runtime();
    if json {
        let value = serde_json::json!({
            "path": Config::config_path()?.display().to_string(),
            "config": config,
            "concurrent_threads": runtime.concurrent_threads,
            "ui_tick_ms": runtime.ui_tick.as_millis() as u64,
            "send_timeout_ms": runtime.send_timeout.as_millis() as u64,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("# {}", Config::config_path()?.display());
    print!("{}", toml::to_string_pretty(config)?);
    println!();
    println!("# effective");
    println!("concurrent_threads = {}", runtime.concurrent_threads);
    println!("ui_tick_ms = {}", runtime.ui_tick.as_millis());
    println!("send_timeout_ms = {}", runtime.send_timeout.as_millis());
    match ProcessEnvironment::from_config(config).resolve("git") {
        Ok(path) => println!("git = {:?}", path.display().to_string()),
        Err(e) => println!("# git: {}", e),
    }
    Ok(())
}
