use anyhow::{bail, Context};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use ticket_order_bot::browser::SessionManager;
use ticket_order_bot::commands::Dispatcher;
use ticket_order_bot::intake::IntakePipeline;
use ticket_order_bot::ledger::{SmsLedger, LEDGER_FILE};
use ticket_order_bot::model::Site;
use ticket_order_bot::notify::{build_bot, Notifier, TelegramNotifier};
use ticket_order_bot::report::interpark::InterparkReporter;
use ticket_order_bot::scheduler::Scheduler;
use ticket_order_bot::sms::SmsConsole;
use ticket_order_bot::store::IntakeStores;
use ticket_order_bot::storefront::StorefrontSource;
use ticket_order_bot::telegram::{startup_text, ChatLoop, Connectivity};
use ticket_order_bot::AppSettings;

const DEFAULT_CONFIG: &str = "config.toml";
const SETUP_WAIT: Duration = Duration::from_secs(300);

enum Mode {
    Run,
    Setup(Site),
}

fn parse_args() -> anyhow::Result<(Mode, String)> {
    let mut args = std::env::args().skip(1);
    let mut mode = Mode::Run;
    let mut config = DEFAULT_CONFIG.to_string();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "setup" => {
                let site = match args.next().as_deref() {
                    Some("storefront") | Some("store") => Site::Storefront,
                    Some("sms") | Some("ppurio") => Site::Sms,
                    other => bail!("usage: ticket-order-bot setup <storefront|sms>, got {other:?}"),
                };
                mode = Mode::Setup(site);
            }
            "--config" | "-c" => {
                config = args.next().context("--config needs a path")?;
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok((mode, config))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ticket_order_bot=info,fantoccini=warn")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    let (mode, config_path) = parse_args()?;
    let settings = Arc::new(
        AppSettings::from_file(&config_path)
            .with_context(|| format!("loading settings from {config_path}"))?,
    );
    std::fs::create_dir_all(&settings.paths.data_dir).with_context(|| {
        format!("creating data directory {}", settings.paths.data_dir.display())
    })?;

    let bot = build_bot(&settings.telegram)?;
    let operator: Arc<dyn Notifier> =
        Arc::new(TelegramNotifier::new(bot.clone(), settings.telegram.chat_id));
    let sessions = Arc::new(SessionManager::new(settings.clone(), operator.clone()));

    if let Mode::Setup(site) = mode {
        tracing::info!(site = %site, "Interactive login");
        let result = sessions.interactive_login(site, SETUP_WAIT).await;
        sessions.shutdown().await;
        result.with_context(|| format!("{site} login"))?;
        tracing::info!(site = %site, "Session saved");
        return Ok(());
    }

    run(settings, bot, operator, sessions).await
}

async fn run(
    settings: Arc<AppSettings>,
    bot: teloxide::Bot,
    operator: Arc<dyn Notifier>,
    sessions: Arc<SessionManager>,
) -> anyhow::Result<()> {
    sessions
        .ensure_driver()
        .await
        .context("starting the WebDriver process")?;
    if let Err(e) = sessions.ensure().await {
        tracing::warn!(error = %e, "Sessions not ready at startup");
    }

    let storefront = Arc::new(StorefrontSource::new(sessions.clone(), settings.clone()));
    let sms = Arc::new(SmsConsole::new(sessions.clone(), settings.clone()));
    let intake = Arc::new(IntakePipeline::new(
        storefront.clone(),
        sms,
        operator.clone(),
        IntakeStores::open(&settings.paths.data_dir),
        SmsLedger::new(settings.data_path(LEDGER_FILE)),
    ));
    let interpark = Arc::new(InterparkReporter::new(settings.clone()));
    let connectivity = Arc::new(Connectivity::default());
    let dispatcher = Arc::new(Dispatcher::new(
        settings.clone(),
        sessions.clone(),
        intake.clone(),
        storefront,
        interpark,
        connectivity.clone(),
    ));

    if let Err(e) = operator.send(startup_text()).await {
        tracing::warn!(error = %e, "Startup message not delivered");
    }

    let scheduler = Arc::new(Scheduler::new(
        settings.schedule.clone(),
        intake.clone(),
        sessions.clone(),
        dispatcher.clone(),
        connectivity.clone(),
        operator.clone(),
    ));
    let jobs = scheduler.spawn();

    let chat = Arc::new(ChatLoop::new(
        bot,
        settings.telegram.clone(),
        dispatcher,
        intake,
        sessions.clone(),
        connectivity,
        operator,
    ));
    let polling = tokio::spawn(chat.run());

    tracing::info!("Bot running");
    shutdown_signal().await;
    tracing::info!("Shutting down");

    polling.abort();
    for job in jobs {
        job.abort();
    }
    sessions.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl-C handler failed");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
