use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hvac_link_lib::{
    ControllerEvent, HvacController, LinkConfig, Priority, Subsystem, ValveTarget,
};

#[derive(Parser)]
#[command(name = "hvac-link")]
#[command(about = "Serial control link for desiccant HVAC units", long_about = None)]
struct Cli {
    /// JSON link configuration; defaults apply for anything missing
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Serial port (overrides the config file)
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Baud rate (overrides the config file)
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Poll sensors and print every event as JSON until interrupted
    Monitor {
        /// Cycle interval in seconds (1-360)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Send one command line, e.g. `$CMD,AIR,FSPD,3`
    Send {
        payload: String,
        /// high, normal or low
        #[arg(long, default_value = "normal")]
        priority: String,
    },
    /// Resynchronise device state for a subsystem
    Reload {
        /// AIR or DSCT
        subsystem: String,
    },
    /// Open or close the valve bank and wait for the result
    Valve {
        /// OPEN or CLOSE
        target: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hvac_link=info,hvac_link_lib=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => LinkConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => LinkConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = Some(port.clone());
    }
    if let Some(baud) = cli.baud {
        config.serial.baud_rate = baud;
    }
    if !matches!(cli.command, Commands::Monitor { .. }) {
        config.polling.autostart = false;
    }
    config.validate()?;

    if let Commands::Ports = cli.command {
        for port in HvacController::available_ports()? {
            println!("{}\t{}", port.port_name, port.description);
        }
        return Ok(());
    }

    let Some(port) = config.serial.port.clone() else {
        bail!("no serial port given; use --port or set serial.port in the config");
    };
    let controller = HvacController::builder(config.clone()).build();
    let info = controller.open(&port, config.serial.baud_rate).await?;
    log::info!("Connected to {} ({})", info.port_name, info.description);

    let result = run_command(&controller, cli.command).await;
    controller.shutdown().await;
    result
}

async fn run_command(controller: &HvacController, command: Commands) -> anyhow::Result<()> {
    let mut events = controller.subscribe_events();
    match command {
        Commands::Ports => Ok(()),
        Commands::Monitor { interval } => {
            if let Some(secs) = interval {
                controller.set_cycle_interval(Duration::from_secs(secs)).await?;
            }
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(event) = events.recv() => print_event(&event)?,
                }
            }
            Ok(())
        }
        Commands::Send { payload, priority } => {
            let priority: Priority = priority.parse().map_err(anyhow::Error::msg)?;
            let outcome = controller.send_command(priority, payload).await?;
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(())
        }
        Commands::Reload { subsystem } => {
            let subsystem: Subsystem = subsystem.parse().map_err(anyhow::Error::msg)?;
            controller.request_reload(subsystem).await?;
            while let Some(event) = events.recv().await {
                match &event {
                    ControllerEvent::ReloadCompleted { subsystem: s, .. } if *s == subsystem => {
                        print_event(&event)?;
                        let state = controller.state_receiver().borrow().clone();
                        println!("{}", serde_json::to_string_pretty(&*state)?);
                        return Ok(());
                    }
                    ControllerEvent::ReloadFailed { subsystem: s, reason } if *s == subsystem => {
                        bail!("reload failed: {}", reason);
                    }
                    _ => {}
                }
            }
            Ok(())
        }
        Commands::Valve { target } => {
            let target: ValveTarget = target.parse().map_err(anyhow::Error::msg)?;
            controller.actuate_valve(target).await?;
            while let Some(event) = events.recv().await {
                match &event {
                    ControllerEvent::ValveProgress { .. } => print_event(&event)?,
                    ControllerEvent::ValveCompleted { .. } => {
                        print_event(&event)?;
                        return Ok(());
                    }
                    ControllerEvent::ValveTimedOut { .. } => bail!("valve {} timed out", target),
                    ControllerEvent::ValveFailed { reason, .. } => bail!("valve {} failed: {}", target, reason),
                    _ => {}
                }
            }
            Ok(())
        }
    }
}

fn print_event(event: &ControllerEvent) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(event)?);
    Ok(())
}
