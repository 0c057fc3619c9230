use backupgate::config::{Options, WrapperLogLevel};
use backupgate::process::{Supervisor, UPSTREAM_PORT};
use backupgate::proxy::{Gateway, GATEWAY_PORT};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit code when options resolution failed
const EXIT_OPTIONS: i32 = 21;
/// Exit code when the wrapped process could not be created
const EXIT_SPAWN: i32 = 22;
/// Exit code when the gateway itself failed
const EXIT_GATEWAY: i32 = 26;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let opts = match Options::load().await {
        Ok(opts) => opts,
        Err(e) => {
            init_logging(WrapperLogLevel::default());
            error!(error = %format!("{e:#}"), "cannot resolve options");
            return EXIT_OPTIONS;
        }
    };

    init_logging(opts.wrapper_log_level);
    print_startup_banner(&opts);

    let supervisor = match Supervisor::start(&opts).await {
        Ok(supervisor) => Arc::new(supervisor),
        Err(e) => {
            error!(error = %format!("{e:#}"), "cannot initialize wrapped process");
            return EXIT_SPAWN;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Relay every catchable signal to the child; termination requests also
    // stop the gateway so the shutdown ordering holds: stop accepting,
    // signal the child, wait for its exit.
    #[cfg(unix)]
    spawn_signal_relay(Arc::clone(&supervisor), shutdown_tx.clone());

    // The gateway also stops once the child is gone, so a crashed server
    // still turns into the wrapper's exit code instead of a dead proxy.
    let waiter = {
        let supervisor = Arc::clone(&supervisor);
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            let result = supervisor.wait().await;
            let _ = shutdown_tx.send(true);
            result
        })
    };

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], GATEWAY_PORT));
    let gateway = Gateway::new(bind_addr, Arc::new(opts), UPSTREAM_PORT, shutdown_rx);
    if let Err(e) = gateway.run().await {
        error!(error = %format!("{e:#}"), "gateway execution failed");
        return EXIT_GATEWAY;
    }

    supervisor.close();

    match waiter.await {
        Ok(Ok(code)) => {
            info!(code, "wrapped process exited");
            code
        }
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "cannot await wrapped process");
            EXIT_GATEWAY
        }
        Err(e) => {
            error!(error = %e, "wait task failed");
            EXIT_GATEWAY
        }
    }
}

fn init_logging(level: WrapperLogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.level_filter().into())
                .from_env_lossy(),
        )
        .init();
}

fn print_startup_banner(opts: &Options) {
    info!(name = PKG_NAME, version = VERSION, "starting wrapper");
    info!(
        gateway_port = GATEWAY_PORT,
        upstream_port = UPSTREAM_PORT,
        gui = opts.gui.as_str(),
        init_path = %opts.gui.init_path(),
        timezone = %opts.timezone,
        log_level = %opts.log_level,
        custom_release = opts.custom_release.is_some(),
        "resolved configuration"
    );
}

/// One task owns signal reception and relays synchronously, in arrival
/// order per signal type.
#[cfg(unix)]
fn spawn_signal_relay(supervisor: Arc<Supervisor>, shutdown_tx: watch::Sender<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{debug, warn};

    tokio::spawn(async move {
        let streams = (|| -> std::io::Result<_> {
            Ok((
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
                signal(SignalKind::quit())?,
                signal(SignalKind::hangup())?,
                signal(SignalKind::user_defined1())?,
                signal(SignalKind::user_defined2())?,
            ))
        })();
        let (mut term, mut int, mut quit, mut hup, mut usr1, mut usr2) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                warn!(error = %e, "cannot install signal handlers");
                return;
            }
        };

        loop {
            let (signo, terminates) = tokio::select! {
                Some(_) = term.recv() => (libc::SIGTERM, true),
                Some(_) = int.recv() => (libc::SIGINT, true),
                Some(_) = quit.recv() => (libc::SIGQUIT, true),
                Some(_) = hup.recv() => (libc::SIGHUP, false),
                Some(_) = usr1.recv() => (libc::SIGUSR1, false),
                Some(_) = usr2.recv() => (libc::SIGUSR2, false),
                else => break,
            };

            debug!(signo, "relaying signal to wrapped process");
            supervisor.signal(signo);
            if terminates {
                let _ = shutdown_tx.send(true);
            }
        }
    });
}
