//! R66 Transfer Server

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use r66_common::run::{RunStatus, TransferRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use r66_server::admin::{self, AdminError};
use r66_server::args::{Args, Command};
use r66_server::blacklist::Blacklist;
use r66_server::client;
use r66_server::connection_tracker::ConnectionTracker;
use r66_server::constants::*;
use r66_server::db::{self, Database, IdStrategy};
use r66_server::recovery::{Instance, recover_orphaned_runs};
use r66_server::registry::ConnectionRegistry;
use r66_server::server::Server;
use r66_server::session::SessionContext;

#[tokio::main]
async fn main() {
    let mut args = Args::parse();

    setup_logging(args.debug);

    // Print banner first
    println!("{}{}", MSG_BANNER, env!("CARGO_PKG_VERSION"));

    let (database, db_path) = setup_db(args.database.clone(), args.id_strategy).await;

    // Administration touches no runs and needs no instance
    match args.command.take() {
        Some(Command::Host { action }) => return print_admin(admin::host(&database, action).await),
        Some(Command::Blacklist { action }) => {
            return print_admin(admin::blacklist(&database, action).await);
        }
        Some(Command::Rule { action }) => return print_admin(admin::rule(&database, action).await),
        Some(Command::Config {
            max_connections,
            max_connections_per_ip,
            blacklist_duration,
        }) => {
            let result = admin::config(
                &database,
                max_connections,
                max_connections_per_ip,
                blacklist_duration,
            )
            .await;
            return print_admin(result);
        }
        command => args.command = command,
    }

    let spool = setup_spool(args.spool.clone(), &db_path);
    let serving = args.command.is_none();
    let (database, instance) = match Instance::start(database, serving).await {
        Ok(started) => started,
        Err(e) => {
            eprintln!("{}{}", ERR_INSTANCE, e);
            std::process::exit(1);
        }
    };
    let ctx = SessionContext::new(database.clone(), spool)
        .with_host_key(args.host_key.clone())
        .blacklist_bad_auth(args.blacklist_bad_auth);

    let outcome = match args.command.take() {
        Some(Command::Send {
            file,
            peer,
            rule,
            requester,
        }) => {
            let requester = requester.unwrap_or_else(|| args.bind.to_string());
            let request = TransferRequest::new(rule, requester, peer, file.to_string_lossy());
            Some(client::send(&ctx, request, args.block_size).await)
        }
        Some(Command::Resume { run_id }) => Some(client::resume(&ctx, run_id).await),
        _ => {
            serve(args, database, ctx).await;
            None
        }
    };

    instance.stop().await;
    if let Some(result) = outcome {
        report(result);
    }
}

/// Run the listener until SIGTERM/SIGINT
async fn serve(args: Args, database: Database, ctx: SessionContext) {
    match recover_orphaned_runs(&database).await {
        Ok(recovered) if !recovered.is_empty() => info!(
            interrupted = recovered.interrupted,
            failed = recovered.failed,
            "recovered runs from stopped processes"
        ),
        Ok(_) => {}
        Err(e) => {
            eprintln!("{}{}", ERR_RECOVERY, e);
            std::process::exit(1);
        }
    }

    // Blacklist: drop expired entries, then load the active ones
    if let Err(e) = database.blacklist.cleanup_expired().await {
        warn!(error = %e, "failed to clean up expired blacklist entries");
    }
    let records = database.blacklist.list_active().await.unwrap_or_else(|e| {
        warn!(error = %e, "failed to load blacklist");
        Vec::new()
    });
    let blacklist = Blacklist::from_records(records);
    if !blacklist.is_empty() {
        info!(entries = blacklist.len(), "blacklist loaded");
    }

    // Connection limits: stored values, overridden by arguments
    let max_connections = match args.max_connections {
        Some(value) => value as usize,
        None => database.config.get_max_connections().await,
    };
    let max_connections_per_ip = match args.max_connections_per_ip {
        Some(value) => value as usize,
        None => database.config.get_max_connections_per_ip().await,
    };
    let tracker = ConnectionTracker::new(max_connections, max_connections_per_ip);
    let blacklist_duration =
        Duration::from_secs(database.config.get_blacklist_duration_secs().await);

    let registry = Arc::new(ConnectionRegistry::new(
        blacklist,
        tracker,
        database.blacklist.clone(),
        blacklist_duration,
    ));

    let addr = SocketAddr::new(args.bind, args.port);
    let server = match Server::bind(addr, registry, ctx).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("{}{}: {}", ERR_BIND_FAILED, addr, e);
            std::process::exit(1);
        }
    };
    let local = server.local_addr().unwrap_or(addr);
    println!("{}{}", MSG_LISTENING, local);

    server
        .run(async {
            setup_shutdown_signal().await;
            println!("{}", MSG_SHUTDOWN_RECEIVED);
        })
        .await;
}

fn setup_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn setup_db(
    database_path: Option<PathBuf>,
    id_strategy: Option<IdStrategy>,
) -> (Database, PathBuf) {
    // Determine database path (use provided path or platform default)
    let db_path = database_path.unwrap_or_else(|| match db::default_database_path() {
        Ok(path) => path,
        Err(e) => {
            eprintln!("{}{}", ERR_GENERIC, e);
            std::process::exit(1);
        }
    });

    // Initialize database connection pool and run migrations
    let pool = match db::init_db(&db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("{}{}", ERR_DATABASE_INIT, e);
            std::process::exit(1);
        }
    };
    println!("{}{}", MSG_DATABASE, db_path.display());

    // The first start pins the strategy; later starts may only repeat it
    let config = db::ConfigDb::new(pool.clone());
    let requested = id_strategy.unwrap_or(IdStrategy::Sequence);
    let strategy = match config.pin_id_strategy(requested).await {
        Ok(stored) => stored,
        Err(e) => {
            eprintln!("{}{}", ERR_ID_STRATEGY, e);
            std::process::exit(1);
        }
    };
    if let Some(explicit) = id_strategy
        && explicit != strategy
    {
        eprintln!(
            "{}database uses '{}', not '{}'",
            ERR_ID_STRATEGY, strategy, explicit
        );
        std::process::exit(1);
    }
    println!("{}{}", MSG_ID_STRATEGY, strategy);

    (Database::new(pool, strategy), db_path)
}

fn setup_spool(spool: Option<PathBuf>, db_path: &Path) -> PathBuf {
    let spool = spool.unwrap_or_else(|| {
        db_path
            .parent()
            .map_or_else(|| PathBuf::from(SPOOL_DIR_NAME), |dir| dir.join(SPOOL_DIR_NAME))
    });

    if let Err(e) = std::fs::create_dir_all(&spool) {
        eprintln!("{}{}: {}", ERR_SPOOL_INIT, spool.display(), e);
        std::process::exit(1);
    }
    println!("{}{}", MSG_SPOOL, spool.display());
    spool
}

/// Print the outcome of a one-shot transfer and exit non-zero on failure
fn report(result: Result<db::TransferRun, client::ClientError>) {
    match result {
        Ok(run) if run.status == RunStatus::Finished => {
            println!("{}{}", MSG_TRANSFER_FINISHED, run.id);
        }
        Ok(run) => {
            eprintln!(
                "{}run {} {} ({})",
                ERR_TRANSFER_FAILED,
                run.id,
                run.status,
                run.error_info.as_deref().unwrap_or("-")
            );
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{}{}", ERR_TRANSFER_FAILED, e);
            std::process::exit(1);
        }
    }
}

/// Print an administration result and exit non-zero on failure
fn print_admin(result: Result<String, AdminError>) {
    match result {
        Ok(out) => {
            if !out.is_empty() {
                println!("{}", out);
            }
        }
        Err(e) => {
            eprintln!("{}{}", ERR_GENERIC, e);
            std::process::exit(1);
        }
    }
}

async fn setup_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect(ERR_SIGNAL_SIGTERM);
        let mut sigint = signal(SignalKind::interrupt()).expect(ERR_SIGNAL_SIGINT);

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect(ERR_SIGNAL_CTRLC);
    }
}
