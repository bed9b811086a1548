use anyhow::Context;
use threadwise::app::{App, Collaborators, Command, Reply};
use threadwise::config::Settings;
use threadwise::{database, telemetry};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let settings = Settings::from_env().context("Invalid configuration")?;
    telemetry::init_tracing(&settings.log_level, settings.log_format)
        .context("Failed to initialise logging")?;

    if let Err(e) = settings.require_endpoints() {
        error!(error = %e, "Missing required configuration");
        return Err(e).context("Refusing to start");
    }

    let pool = database::init_db(&settings.database_url)
        .await
        .context("Failed to initialise database")?;
    let collaborators = Collaborators::from_settings(&settings)
        .await
        .context("Failed to set up collaborators")?;
    let app = App::start(&settings, pool, collaborators)
        .await
        .context("Failed to start services")?;
    info!("Threadwise ready, reading commands from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else {
            info!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Command>(&line) {
            Ok(command) => app.dispatch(command).await,
            Err(e) => {
                warn!(error = %e, "Unreadable command line");
                Reply::Error {
                    message: format!("Invalid command: {}", e),
                    transient: false,
                }
            }
        };

        let mut out = serde_json::to_vec(&reply)?;
        out.push(b'\n');
        stdout.write_all(&out).await?;
        stdout.flush().await?;
    }

    app.shutdown().await.context("Scheduler did not stop cleanly")?;
    info!("Shutdown complete");
    Ok(())
}
