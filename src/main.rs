//! # netmeter - Main Entry Point
//!
//! Runs a measurement with synthetic traffic standing in for sockets, so the
//! whole reporting path (packet rings, reporter thread, interval and sum
//! reports, histograms) can be exercised without a network peer.
//!
//! ## Execution Flow
//!
//! 1. **Parse arguments** and initialize logging
//! 2. **Build settings**: one [`StreamSettings`] value shared by all streams
//! 3. **Start the reporter** with a text sink, or a JSON sink with `-o`
//! 4. **Start traffic**: one OS thread per stream; with `-P` the streams form
//!    a group that starts together behind the group barrier
//! 5. **Wait** for the traffic threads, then shut the reporter down
//!
//! Ctrl-C interrupts the test: traffic threads stop posting and the reporter
//! closes every stream with its partial interval and final report.

use anyhow::{Context, Result};
use clap::Parser;
use netmeter::{
    cli::Args,
    logging::init_logging,
    output::{JsonSink, ReportSink, TextSink},
    reporter::{Reporter, StreamReporter, TestContext},
    simulate::{Pacing, SourceSummary, SyntheticSource},
    utils::{format_bytes, format_duration, validate_buffer_len, validate_parallel},
    ReportError, StreamSettings, Timestamp,
};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Keep the guard alive so buffered file logs are written on exit.
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    validate_parallel(args.parallel)?;
    let settings = StreamSettings::from(&args);
    validate_buffer_len(settings.buffer_len)?;
    settings.validate().context("Invalid stream settings")?;

    info!(
        "Starting netmeter {}: {} {} x{} for {}",
        netmeter::VERSION,
        settings.role,
        settings.protocol,
        args.parallel,
        format_duration(args.time)
    );
    debug!("Configuration: {:?}", args);

    let context = Arc::new(TestContext::new());
    let sink: Box<dyn ReportSink> = match &args.output_file {
        Some(path) => Box::new(
            JsonSink::create(path, context.run_id())
                .with_context(|| format!("Failed to create output file {:?}", path))?,
        ),
        None => Box::new(TextSink::stdout().with_enhanced(settings.enhanced)),
    };
    let reporter = Reporter::spawn(Arc::clone(&context), sink)?;

    // Ctrl-C stops traffic and makes the reporter close every stream.
    let signal_context = Arc::clone(&context);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_context.interrupt();
        }
    });

    let multi = if args.parallel > 1 {
        Some(context.init_multi(args.parallel)?)
    } else {
        None
    };

    let mut traffic = Vec::with_capacity(args.parallel);
    for index in 0..args.parallel {
        let stream = reporter.register_stream(settings.clone(), multi.clone())?;
        let source = SyntheticSource::new(settings.clone(), args.simulation(), index as u64);
        let context = Arc::clone(&context);
        let handle = thread::Builder::new()
            .name(format!("stream-{}", stream.stream_id()))
            .spawn(move || run_stream(stream, source, &context))
            .context("Failed to spawn traffic thread")?;
        traffic.push(handle);
    }

    // Joining blocks, so it happens off the async runtime that serves Ctrl-C.
    let summaries = tokio::task::spawn_blocking(move || -> Result<Vec<SourceSummary>> {
        let mut summaries = Vec::with_capacity(traffic.len());
        for handle in traffic {
            let summary = handle
                .join()
                .map_err(|_| anyhow::anyhow!("Traffic thread panicked"))??;
            summaries.push(summary);
        }
        reporter.shutdown();
        reporter.join()?;
        Ok(summaries)
    })
    .await
    .context("Reporter shutdown task failed")??;

    let bytes: u64 = summaries.iter().map(|s| s.bytes).sum();
    let rejected: u64 = summaries.iter().map(|s| s.rejected).sum();
    if rejected > 0 {
        warn!("{} events were not accepted by the reporter", rejected);
    }
    if context.is_interrupted() {
        info!("netmeter interrupted after {}", format_bytes(bytes));
    } else {
        info!("netmeter completed: {}", format_bytes(bytes));
    }
    Ok(())
}

/// Body of one traffic thread.
///
/// Waits until the reporter has adopted the stream and, for a group, until
/// every member is ready, then posts the synthetic events paced against the
/// wall clock and closes the stream.
fn run_stream(
    mut stream: StreamReporter,
    source: SyntheticSource,
    context: &TestContext,
) -> Result<SourceSummary> {
    match stream
        .await_reporter_ready()
        .and_then(|_| stream.barrier_wait())
    {
        Ok(_) => {}
        Err(ReportError::Interrupted) => {
            stream.close();
            return Ok(SourceSummary::default());
        }
        Err(e) => return Err(e.into()),
    }

    let start = stream
        .multi()
        .and_then(|m| m.start_time())
        .unwrap_or_else(Timestamp::now);
    let mut source = source.with_start(start);
    let summary = source.run(&mut stream, Pacing::RealTime, &context.interrupt_flag());
    stream.close();
    Ok(summary)
}
