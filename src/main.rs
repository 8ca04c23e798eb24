use color_eyre::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wagner_remote::control::console::{ConsoleCommand, HELP};
use wagner_remote::control::{ControlPad, SpeedUpdate};
use wagner_remote::mqtt::rumqtt::RumqttConnector;
use wagner_remote::mqtt::{ConnectionState, ConnectivityEvent, PublishAck, Session};
use wagner_remote::persistence::{DeviceProfile, ProfileStore};

/// Everything a console line may touch
struct Remote {
    store: ProfileStore,
    profile: DeviceProfile,
    session: Session,
    pad: ControlPad,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    // the profile decides the broker, so it is loaded before any connection
    let store = ProfileStore::default_location();
    let profile = store.load().await;
    info!("Using profile {}", store.path().display());

    let session = Session::new(RumqttConnector::default());
    let mut connectivity = session.on_connectivity_change();
    let pad = ControlPad::new(session.clone(), &profile)?;

    if let Err(e) = session.connect(profile.broker_config()).await {
        // keep running, the operator can still pick another broker
        error!("Could not connect: {}", e);
    }

    let mut remote = Remote {
        store,
        profile,
        session,
        pad,
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = connectivity.recv() => match event {
                Ok(event) => remote.on_connectivity(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} connectivity events", missed);
                    if remote.session.state() == ConnectionState::Connected {
                        remote.resubscribe();
                    }
                }
                Err(RecvError::Closed) => break,
            },
            Some(message) = remote.pad.next_telemetry() => {
                if let SpeedUpdate::Changed(speed) = remote.pad.apply_telemetry(&message) {
                    println!("speed {}", speed);
                }
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !remote.handle_line(&line).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!("Shutting down");
    remote.session.disconnect_and_end().await;
    Ok(())
}

impl Remote {
    fn on_connectivity(&self, event: &ConnectivityEvent) {
        match (&event.state, &event.reason) {
            (ConnectionState::Connected, _) => {
                println!("connected");
                self.resubscribe();
            }
            (state, Some(reason)) => println!("{}: {}", state, reason),
            (state, None) => println!("{}", state),
        }
    }

    fn resubscribe(&self) {
        if let Err(e) = self.pad.on_connected() {
            error!("Could not subscribe {}: {}", self.pad.speed_topic(), e);
        }
    }

    /// Returns false when the operator asked to quit
    async fn handle_line(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }
        let command = match line.parse::<ConsoleCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };

        match command {
            ConsoleCommand::Press(gesture) => match self.pad.press(gesture) {
                Ok(ack) => report_ack(gesture.to_string(), ack),
                Err(e) => println!("{}", e),
            },
            ConsoleCommand::Speed(value) => match self.pad.set_speed(value) {
                Ok(ack) => report_ack(format!("speed {}", self.pad.displayed_speed()), ack),
                Err(e) => println!("{}", e),
            },
            ConsoleCommand::Settings(change) => {
                let reconnect = change.changes_broker();
                if let Err(e) = self.store.apply(&mut self.profile, change).await {
                    println!("Settings not saved: {}", e);
                    return true;
                }
                if let Err(e) = self
                    .pad
                    .retarget(&self.profile.control_topic, &self.profile.speed_topic)
                {
                    error!("Could not switch topics: {}", e);
                }
                if reconnect {
                    if let Err(e) = self.session.configure(self.profile.broker_config()).await {
                        println!("Could not switch broker: {}", e);
                    }
                }
            }
            ConsoleCommand::Status => self.print_status(),
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Quit => return false,
        }
        true
    }

    fn print_status(&self) {
        let status = self.session.status();
        println!("state:     {}", status.connection_state);
        println!(
            "broker:    {}",
            status.broker.as_deref().unwrap_or("none")
        );
        println!("control:   {}", self.pad.control_topic());
        println!("speed:     {} ({})", self.pad.displayed_speed(), self.pad.speed_topic());
        println!("buttons:   {}", if self.profile.buttons_option { "on" } else { "off" });
        println!(
            "traffic:   {} sent, {} received",
            status.messages_sent, status.messages_received
        );
        if let Some(at) = status.last_activity {
            println!("last seen: {}", at.format("%H:%M:%S"));
        }
        for message in &status.error_messages {
            println!("error:     {}", message);
        }
    }
}

fn report_ack(what: String, ack: PublishAck) {
    tokio::spawn(async move {
        if let Err(e) = ack.wait().await {
            warn!("{} was not acknowledged: {}", what, e);
        }
    });
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
