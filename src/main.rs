use std::{env, io, process};

use log::info;
use tokio::signal;

use training_scheduler::{
    SchedulerConfig, ShutdownSignal,
    driver::{self, DemoRun},
};

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <config.yml> <model-name> [workers]", args[0]);
        process::exit(1);
    }

    let config = SchedulerConfig::from_path(&args[1]).map_err(io::Error::other)?;
    let workers = match args.get(3) {
        Some(n) => n
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("workers: {e}")))?,
        None => 1,
    };

    let demo = DemoRun {
        name: args[2].clone(),
        workers,
        ..DemoRun::default()
    };
    info!("training {} on {workers} worker(s)", demo.name);

    let interrupt = ShutdownSignal::new();
    let run = driver::run(config, demo, interrupt.clone());
    tokio::pin!(run);

    let states = tokio::select! {
        ret = &mut run => ret?,
        _ = signal::ctrl_c() => {
            info!("received SIGINT, saving and exiting");
            interrupt.request();
            run.await?
        }
    };

    if let Some(state) = states.first() {
        info!(
            "done after {} updates in epoch {}, learning rate {:.4e}",
            state.batches, state.epochs, state.eta
        );
    }
    Ok(())
}
