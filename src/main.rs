//! Binary entry point for the weiboloader CLI.

use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use weiboloader::cli::{self, Cli};
use weiboloader::context::{ContextOptions, LoginStatus, WeiboContext};
use weiboloader::error::{LoaderError, EXIT_OK, EXIT_PARTIAL};
use weiboloader::events::{safe_emit, Event, EventKind, NullSink, ProgressSink};
use weiboloader::ratecontrol::{RateLimits, SlidingWindowRateController};
use weiboloader::shutdown::{self, ShutdownCoordinator};
use weiboloader::ui::IndicatifSink;
use weiboloader::{LoaderOptions, WeiboLoader};

/// Initialize tracing with optional JSON formatting via `LOG_FORMAT=json`.
fn init_tracing() {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weiboloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() {
    init_tracing();

    // Install the interrupt flag before anything can block on the network.
    let shutdown = ShutdownCoordinator::shared();
    shutdown::set_global_shutdown(shutdown.clone());
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("interrupt received - saving progress...");
            shutdown.request_shutdown();
        }) {
            warn!(error = %e, "cannot install interrupt handler");
        }
    }

    let cli = Cli::parse();

    let sink: Arc<dyn ProgressSink> = if std::io::stderr().is_terminal() {
        Arc::new(IndicatifSink::new())
    } else {
        Arc::new(NullSink)
    };

    let code = match run(&cli, sink.clone()) {
        Ok(all_ok) => {
            if all_ok {
                EXIT_OK
            } else {
                EXIT_PARTIAL
            }
        }
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };

    sink.close();
    std::process::exit(code);
}

fn run(cli: &Cli, sink: Arc<dyn ProgressSink>) -> Result<bool, LoaderError> {
    let targets = cli::parse_targets(cli)?;

    let rate = Arc::new(SlidingWindowRateController::new(RateLimits {
        request_interval: Duration::from_secs_f64(cli.request_interval),
        ..RateLimits::default()
    }));

    let ctx = Arc::new(WeiboContext::new(
        rate,
        sink.clone(),
        ContextOptions {
            captcha_mode: cli.captcha_mode,
            session_path: cli.session_file.clone(),
            max_workers: cli.max_workers,
            ..ContextOptions::default()
        },
    )?);

    let mut has_auth = ctx.load_session().is_some();

    if let Some(browser) = &cli.load_cookies {
        return Err(LoaderError::Init(format!(
            "--load-cookies {browser} is not supported in this build; \
             export the cookies and pass --cookie-file instead"
        )));
    }
    if let Some(cookie) = &cli.cookie {
        ctx.set_cookies_from_string(cookie)?;
        has_auth = true;
    }
    if let Some(path) = &cli.cookie_file {
        ctx.set_cookies_from_file(path)?;
        has_auth = true;
    }
    if cli.visitor_cookies {
        safe_emit(
            sink.as_ref(),
            &Event {
                message: Some("Fetching visitor cookies".to_string()),
                ..Event::new(EventKind::Stage)
            },
        );
        ctx.fetch_visitor_cookies()?;
        has_auth = true;
    }

    if has_auth {
        if !ctx.has_sub_cookie() {
            return Err(LoaderError::Auth(
                "no SUB cookie present; the credential is unusable".to_string(),
            ));
        }
        let status = ctx.verify_login();
        let message = match &status {
            LoginStatus::LoggedIn { uid } => format!("Logged in as {uid}"),
            LoginStatus::LoggedOut => "Session expired - continuing anonymously".to_string(),
            LoginStatus::Unknown => "Login status unknown".to_string(),
        };
        safe_emit(
            sink.as_ref(),
            &Event {
                message: Some(message.clone()),
                ..Event::new(EventKind::LoginStatus)
            },
        );
        info!("{message}");

        // Sessions are persisted only for verified logins; expired or
        // unknown sessions leave existing files untouched.
        if let LoginStatus::LoggedIn { uid } = &status {
            match ctx.save_session(uid) {
                Ok(path) => info!(path = %path.display(), "session saved"),
                Err(e) => warn!(error = %e, "session not saved"),
            }
        }
    }

    let options = LoaderOptions {
        dirname_pattern: cli.dirname_pattern.clone(),
        filename_pattern: cli.filename_pattern.clone(),
        no_videos: cli.no_videos,
        no_pictures: cli.no_pictures,
        count: cli.count,
        fast_update: cli.fast_update,
        latest_stamps: cli.latest_stamps.clone(),
        metadata_json: cli.metadata_json,
        post_metadata_txt: cli.post_metadata_txt.clone(),
        max_workers: cli.max_workers,
        no_resume: cli.no_resume,
        checkpoint_dir: cli.checkpoint_dir.clone(),
        output_dir: cli.output_dir.clone(),
    };

    let mut loader = WeiboLoader::new(ctx, options, sink)?;
    let results = loader.download_targets(&targets)?;

    for (key, ok) in &results {
        info!(target = %key, ok, "target finished");
    }
    Ok(!results.is_empty() && results.values().all(|ok| *ok))
}
