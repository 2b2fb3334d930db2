//! Kommandozeilen-Dialer
//!
//! Wählt eine Nummer, gibt Zustandswechsel aus und legt bei Ctrl-C auf.

use anyhow::{bail, Context};
use clap::Parser;
use pulse_dialer::{init_logging, AppConfig, CallEvent, CallStatus, Dialer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Place an outbound call to a phone number", long_about = None)]
struct Args {
    /// Nummer in E.164 (z.B. +14155550123) oder national mit --dial-code
    number: Option<String>,

    /// Ländervorwahl (z.B. +49); `number` ist dann die nationale Nummer
    #[arg(short, long)]
    dial_code: Option<String>,

    /// Bearer Token der Call-API
    #[arg(long, env = "PULSE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Überschreibt die Basis-URL der Call-API
    #[arg(long)]
    api_url: Option<String>,

    /// Nur Geräte prüfen, nicht wählen
    #[arg(long)]
    check_devices: bool,
}

impl Args {
    /// Nummer und Token, nur zum Wählen erforderlich
    fn dial_target(&self) -> anyhow::Result<(&str, &str)> {
        let Some(number) = self.number.as_deref() else {
            bail!("a number is required unless --check-devices is given");
        };
        let Some(token) = self.token.as_deref() else {
            bail!("a token is required to dial (--token or PULSE_TOKEN)");
        };
        Ok((number, token))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if !args.check_devices {
        args.dial_target()?;
    }

    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(url) = args.api_url.clone() {
        config.api_base_url = url;
    }
    init_logging(&config.log_filter);

    let dialer = Dialer::init(config).await?;

    let devices = dialer.device_state();
    println!(
        "Microphone: {}  Speaker: {}",
        describe(devices.microphone_ok),
        describe(devices.speaker_ok)
    );
    if args.check_devices {
        return Ok(());
    }
    if devices.microphone_blocked() {
        bail!(
            "microphone unavailable: {}",
            devices.last_error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    let (number, token) = args.dial_target()?;
    let mut events = dialer.subscribe();
    let session = match &args.dial_code {
        Some(code) => dialer.start_call(code, number, token).await?,
        None => dialer.start_call_e164(number, token).await?,
    };
    println!("Calling {} ...", session.target_number.map(|t| t.to_string()).unwrap_or_default());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Hanging up");
                dialer.hang_up().await;
                break;
            }
            event = events.recv() => match event {
                Ok(CallEvent::StateChanged(session)) => {
                    println!("Status: {}", session.status.as_str());
                    match session.status {
                        CallStatus::Finished => break,
                        CallStatus::Failed => {
                            bail!(session.last_error.unwrap_or_else(|| "call failed".to_string()));
                        }
                        _ => {}
                    }
                }
                Ok(CallEvent::RemoteMedia) => println!("Remote audio connected"),
                Ok(CallEvent::AudioLevel { input, output }) => {
                    tracing::trace!("Levels in={:.2} out={:.2}", input, output);
                }
                Ok(CallEvent::Error(message)) => eprintln!("Error: {}", message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    dialer.teardown().await;
    Ok(())
}

fn describe(ok: Option<bool>) -> &'static str {
    match ok {
        Some(true) => "ok",
        Some(false) => "unavailable",
        None => "unknown",
    }
}
