use std::{process, sync::Arc};

use apalis::prelude::{Monitor, WorkerBuilder, WorkerFactoryFn};
use apalis_cron::CronStream;
use tagcache::{
    application::{
        error::{AppError, ErrorReport},
        jobs::{ReaperContext, process_reap_job, reap_once},
        tag_args::parse_tag_args,
    },
    cache::{CacheConfig, MetadataIndex},
    config::{self, Command, InvalidateArgs, Settings},
    infra::{
        cache::{CacheBackends, build_cacher, connect_index},
        db::PostgresIndex,
        error::InfraError,
        telemetry,
    },
};
use time::OffsetDateTime;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(i32::from(error.exit_code()));
    }
}

fn report_application_error(error: &AppError) {
    let report = ErrorReport::from_error("tagcache::main", error);
    if dispatcher::has_been_set() {
        error!(error = %report.summary(), "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %report.summary(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command.unwrap_or(Command::Reaper(Default::default())) {
        Command::Reaper(_) => run_reaper(settings).await,
        Command::Reap(_) => run_reap(settings).await,
        Command::Invalidate(args) => run_invalidate(settings, args).await,
        Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: Settings) -> Result<(), AppError> {
    let index = connect_index(&settings).await?;
    PostgresIndex::run_migrations(index.pool())
        .await
        .map_err(InfraError::from)?;
    info!("Migrations applied");
    Ok(())
}

async fn run_reap(settings: Settings) -> Result<(), AppError> {
    let index = connect_index(&settings).await?;
    let reaped = reap_once(&index, OffsetDateTime::now_utc())
        .await
        .map_err(InfraError::from)?;
    info!(reaped_count = reaped, "Reaped expired cache metadata");
    println!("Removed {reaped} expired metadata rows");
    Ok(())
}

async fn run_reaper(settings: Settings) -> Result<(), AppError> {
    let schedule = settings.reaper.cron_schedule()?;
    let index: Arc<dyn MetadataIndex> = Arc::new(connect_index(&settings).await?);

    let worker = WorkerBuilder::new("cache-meta-reaper")
        .data(ReaperContext { index })
        .backend(CronStream::new(schedule))
        .build_fn(process_reap_job);

    info!(schedule = %settings.reaper.schedule, "Starting metadata reaper");
    Monitor::new()
        .register(worker)
        .run()
        .await
        .map_err(|err| AppError::unexpected(format!("reaper monitor stopped: {err}")))
}

async fn run_invalidate(settings: Settings, args: InvalidateArgs) -> Result<(), AppError> {
    let all_of = parse_tag_args(&args.all_of)?;
    let any_of = parse_tag_args(&args.any_of)?;
    if all_of.is_empty() && any_of.is_empty() {
        return Err(AppError::validation(
            "at least one --all-of or --any-of tag is required",
        ));
    }

    let names: Vec<String> = all_of
        .iter()
        .chain(any_of.iter())
        .map(|(name, _)| name.clone())
        .collect();
    let backends = CacheBackends::connect(&settings).await?;
    let cacher = build_cacher(CacheConfig::from(&settings.cache), backends, names)?;
    let invalidator = cacher
        .invalidator()
        .ok_or_else(|| AppError::unexpected("cacher was built without an invalidator"))?;

    let swept = invalidator.invalidate(&args.label, &all_of, &any_of).await?;
    if swept {
        info!(label = %args.label, prefix = %invalidator.prefix(), "Invalidation complete");
    } else {
        info!(label = %args.label, "No whitelisted tag given; nothing invalidated");
    }
    Ok(())
}
