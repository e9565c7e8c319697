use std::io::{self, Write};
use std::process;

use cache_triage::{
    config::{self, CheckConfigArgs, Command, SimulateArgs},
    error::AppError,
    infra::telemetry,
    simulate::{self, Scenario},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Simulate(args) => run_simulate(settings, args).await,
        Command::CheckConfig(args) => run_check_config(settings, args),
    }
}

async fn run_simulate(settings: config::Settings, args: SimulateArgs) -> Result<(), AppError> {
    info!(
        target = "cache_triage::simulate",
        path = %args.scenario.display(),
        "Loading scenario"
    );
    let scenario = Scenario::load(&args.scenario).map_err(simulate::SimulateError::from)?;
    let reports = simulate::run(&settings, &scenario).await?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for report in &reports {
        serde_json::to_writer(&mut out, report)
            .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn run_check_config(settings: config::Settings, _args: CheckConfigArgs) -> Result<(), AppError> {
    let mut out = io::stdout().lock();
    writeln!(out, "{settings:#?}")?;
    Ok(())
}
