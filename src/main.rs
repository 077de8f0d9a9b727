use std::{
    process,
    sync::{Arc, Mutex, PoisonError},
};

use mdcache::{
    application::{
        error::AppError,
        render::{
            CoalescerConfig, DocumentRenderer, RenderCoalescer, RenderContext, StreamSnapshot,
            StreamingSimulator,
        },
    },
    cache::{ImageCache, ImageCacheConfig, MeasureConfig, PoolConfig, TargetSize},
    config::{self, FetchImageArgs, SimulateArgs},
    infra::{http::HttpFetcher, telemetry},
    util::bytes::{format_bytes, format_usage},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(
            error_code = error.code(),
            error = %report.chain(),
            source = report.source,
            "application error"
        );
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(
            error_code = error.code(),
            error = %report.chain(),
            source = report.source,
            "application error"
        );
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let Some(command) = cli_args.command else {
        return Err(AppError::validation(
            "no command given; try `mdcache --help`",
        ));
    };

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Simulate(args) => run_simulate(&settings, args).await,
        config::Command::FetchImage(args) => run_fetch_image(&settings, args).await,
        config::Command::DiskUsage => run_disk_usage(&settings).await,
        config::Command::Clear => run_clear(&settings).await,
    }
}

async fn open_image_cache(settings: &config::Settings) -> Result<Arc<ImageCache>, AppError> {
    let fetcher = HttpFetcher::new(settings.images.fetch_timeout)?;
    let cache = ImageCache::open(ImageCacheConfig::from(&settings.images), Arc::new(fetcher)).await?;
    Ok(Arc::new(cache))
}

async fn run_simulate(settings: &config::Settings, args: SimulateArgs) -> Result<(), AppError> {
    if !args.width.is_finite() || args.width <= 0.0 {
        return Err(AppError::validation("--width must be a positive number"));
    }
    let text = tokio::fs::read_to_string(&args.file).await?;

    let images = open_image_cache(settings).await?;
    let context = Arc::new(RenderContext::new(
        &PoolConfig::from(&settings.pool),
        &MeasureConfig::from(&settings.measure),
        images,
    ));
    let renderer = Arc::new(Mutex::new(DocumentRenderer::new(
        Arc::clone(&context),
        args.width,
    )));

    let sink = Arc::clone(&renderer);
    let coalescer = RenderCoalescer::new(
        CoalescerConfig::from(&settings.streaming),
        move |snapshot: StreamSnapshot| {
            let mut renderer = sink.lock().unwrap_or_else(PoisonError::into_inner);
            let summary = renderer.render(&snapshot.text, !snapshot.finished);
            info!(
                op = "simulate::render",
                finished = snapshot.finished,
                chars = snapshot.text.len(),
                blocks = summary.blocks,
                attachments = summary.attachments,
                exact = summary.pass.exact,
                fallback = summary.pass.fallback,
                created = summary.pass.created,
                recycled = summary.pass.recycled,
                "Rendered snapshot"
            );
        },
    );

    let simulator = StreamingSimulator::with_tick(text, settings.streaming.tick_interval);
    let chunks = simulator.run(&coalescer).await;

    let renders = renderer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .renders();
    info!(
        op = "simulate",
        file = %args.file.display(),
        chunks,
        renders,
        "Simulation finished"
    );
    context.log_stats("simulate");
    context.images().log_stats("simulate");

    let pool = context.pool().stats();
    let measure = context.measurements().stats();
    println!("chunks: {chunks}, renders: {renders}");
    println!(
        "pool: {} exact, {} fallback, {} misses ({:.1}% hit rate)",
        pool.exact_hits,
        pool.fallback_hits,
        pool.misses,
        pool.hit_rate()
    );
    println!(
        "measurements: {} hits, {} misses, {} evictions",
        measure.hits, measure.misses, measure.evictions
    );
    Ok(())
}

async fn run_fetch_image(
    settings: &config::Settings,
    args: FetchImageArgs,
) -> Result<(), AppError> {
    if args.width == 0 || args.height == 0 {
        return Err(AppError::validation("--width and --height must be non-zero"));
    }
    let cache = open_image_cache(settings).await?;
    let target = TargetSize::new(args.width, args.height);

    let image = cache
        .image(&args.source, target)
        .await
        .ok_or_else(|| AppError::unexpected(format!("could not load image `{}`", args.source)))?;

    println!(
        "{}: {}x{} decoded ({})",
        args.source,
        image.width(),
        image.height(),
        format_bytes(image.cost())
    );
    cache.log_stats("fetch-image");
    Ok(())
}

async fn run_disk_usage(settings: &config::Settings) -> Result<(), AppError> {
    let cache = open_image_cache(settings).await?;
    let budget = ImageCacheConfig::from(&settings.images).disk_budget_bytes();
    println!(
        "{}: {}",
        cache.disk_cache_directory().display(),
        format_usage(cache.current_disk_cache_size(), budget)
    );
    Ok(())
}

async fn run_clear(settings: &config::Settings) -> Result<(), AppError> {
    let cache = open_image_cache(settings).await?;
    let before = cache.current_disk_cache_size();
    cache.clear_all().await?;
    info!(op = "clear", freed_bytes = before, "Image cache cleared");
    println!("cleared {}", format_bytes(before));
    Ok(())
}
