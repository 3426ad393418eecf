//! ecgr - command-line interface for the ECG receiver
//!
//! Commands:
//! - monitor: Stream a recording, stdin or device node and print events as NDJSON
//! - analyze: Compute features for a recording (offline), optionally per window
//! - diagnose: Run one diagnosis cycle for a recording, optionally per window
//! - doctor: Check configuration and credentials

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, BufReader};

use ecg_receiver::config::{AppConfig, EndpointProtocol};
use ecg_receiver::diagnosis::{diagnose_windows, CycleOutcome, DiagnosisBackend, TriggerError};
use ecg_receiver::events::PipelineEvent;
use ecg_receiver::logging::setup_logging;
use ecg_receiver::{
    BufferSnapshot, DiagnosisError, DiagnosisRequest, EcgError, EcgMonitor, EventBus,
    FeatureExtractor, HttpDiagnosisClient, IngestStats, PatientContext, SharedBuffer,
    StreamSession, PRODUCER_NAME, VERSION,
};

/// ecgr - streaming ECG receiver with advisory remote diagnosis
#[derive(Parser)]
#[command(name = "ecgr")]
#[command(version = VERSION)]
#[command(about = "Ingest ECG streams, derive features and request advisory diagnoses", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream input and print pipeline events as NDJSON
    Monitor {
        /// Input path: recording, device node, or - for stdin
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Enable periodic diagnosis
        #[arg(long)]
        auto: bool,

        /// Include every decoded sample in the output
        #[arg(long)]
        samples: bool,

        #[command(flatten)]
        patient: PatientArgs,
    },

    /// Compute features for a recording
    Analyze {
        /// Input path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        window: WindowArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one diagnosis cycle over a recording
    Diagnose {
        /// Input path (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        patient: PatientArgs,

        #[command(flatten)]
        window: WindowArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Diagnose configuration and credentials
    Doctor {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct PatientArgs {
    /// Patient age in years
    #[arg(long)]
    age: Option<u32>,

    /// Patient gender
    #[arg(long)]
    gender: Option<String>,

    /// Reported symptoms
    #[arg(long)]
    symptoms: Option<String>,
}

#[derive(clap::Args)]
struct WindowArgs {
    /// Analyse the whole recording in overlapping windows
    #[arg(long)]
    windowed: bool,

    /// Samples per window (default from config: 2500)
    #[arg(long, requires = "windowed")]
    window_size: Option<usize>,

    /// Overlap between windows, 0.0 to <1.0 (default from config: 0.5)
    #[arg(long, requires = "windowed")]
    overlap: Option<f64>,
}

impl WindowArgs {
    /// Apply the overrides; returns whether windowed mode is on.
    fn apply(&self, config: &mut AppConfig) -> Result<bool, EcgCliError> {
        if let Some(size) = self.window_size {
            config.window.size = size;
            config.window.max_recording_samples = config.window.max_recording_samples.max(size);
        }
        if let Some(overlap) = self.overlap {
            config.window.overlap = overlap;
        }
        config.validate().map_err(EcgError::from)?;
        Ok(self.windowed)
    }
}

impl PatientArgs {
    fn context(self) -> Option<PatientContext> {
        let context = PatientContext {
            age: self.age,
            gender: self.gender,
            symptoms: self.symptoms,
        };
        (!context.is_empty()).then_some(context)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            report_error(EcgCliError::Io(e));
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_error(e);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: EcgCliError) {
    eprintln!(
        "{}",
        serde_json::to_string(&CliError::from(e)).unwrap_or_else(|_| "Unknown error".to_string())
    );
}

async fn run(cli: Cli) -> Result<(), EcgCliError> {
    let config = AppConfig::load(cli.config.as_deref()).map_err(EcgError::from)?;
    setup_logging(&config.logging)?;

    match cli.command {
        Commands::Monitor {
            input,
            auto,
            samples,
            patient,
        } => cmd_monitor(config, &input, auto, samples, patient.context()).await,

        Commands::Analyze {
            input,
            window,
            json,
        } => {
            let mut config = config;
            if window.apply(&mut config)? {
                cmd_analyze_windows(config, &input, json).await
            } else {
                cmd_analyze(config, &input, json).await
            }
        }

        Commands::Diagnose {
            input,
            patient,
            window,
            json,
        } => {
            let mut config = config;
            if window.apply(&mut config)? {
                cmd_diagnose_windows(config, &input, patient.context(), json).await
            } else {
                cmd_diagnose(config, &input, patient.context(), json).await
            }
        }

        Commands::Doctor { json } => cmd_doctor(config, cli.config.as_deref(), json),
    }
}

async fn open_input(input: &Path) -> Result<Box<dyn AsyncBufRead + Unpin + Send>, EcgCliError> {
    if input.to_string_lossy() == "-" {
        Ok(Box::new(BufReader::new(tokio::io::stdin())))
    } else {
        let file = tokio::fs::File::open(input).await?;
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Backend used when no credential is configured and nothing asks for a diagnosis
struct OfflineBackend;

#[async_trait]
impl DiagnosisBackend for OfflineBackend {
    async fn submit(&self, _request: &DiagnosisRequest) -> Result<String, DiagnosisError> {
        Err(DiagnosisError::Network("diagnosis is offline: no API key configured".to_string()))
    }
}

async fn cmd_monitor(
    mut config: AppConfig,
    input: &Path,
    auto: bool,
    samples: bool,
    patient: Option<PatientContext>,
) -> Result<(), EcgCliError> {
    config.diagnosis.auto_enabled |= auto;

    let mut monitor = if config.diagnosis.auto_enabled {
        EcgMonitor::from_config(config)?
    } else {
        match EcgMonitor::from_config(config.clone()) {
            Ok(monitor) => monitor,
            Err(EcgError::Config(_)) => EcgMonitor::new(config, Arc::new(OfflineBackend)),
            Err(e) => return Err(e.into()),
        }
    };
    monitor.set_patient_context(patient);

    let mut events = monitor.subscribe();
    monitor.connect(open_input(input).await?);

    let mut stdout = io::stdout();
    let stats = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => write_event(&mut stdout, &event, samples)?,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event output lagging");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break None,
            },
            finished = monitor.wait() => break finished,
        }
    };

    // Let an in-flight diagnosis finish, then flush what is left
    monitor.orchestrator().wait_idle().await;
    while let Ok(event) = events.try_recv() {
        write_event(&mut stdout, &event, samples)?;
    }

    if let Some(stats) = stats {
        let stats = stats?;
        writeln!(stdout, "{}", serde_json::json!({ "event": "summary", "data": stats }))?;
    }
    stdout.flush()?;
    monitor.shutdown();
    Ok(())
}

fn write_event(out: &mut impl Write, event: &PipelineEvent, samples: bool) -> Result<(), EcgCliError> {
    if matches!(event, PipelineEvent::Sample(_)) && !samples {
        return Ok(());
    }
    writeln!(out, "{}", serde_json::to_string(event)?)?;
    Ok(())
}

/// Read a recording into a buffer of `capacity` samples
async fn load_recording(
    config: &AppConfig,
    input: &Path,
    capacity: usize,
) -> Result<(BufferSnapshot, IngestStats), EcgCliError> {
    let buffer = SharedBuffer::new(capacity);
    let session = StreamSession::new(&config.stream, buffer.clone(), EventBus::new(1));
    let stats = session.run(open_input(input).await?).await?;
    if stats.samples == 0 {
        return Err(EcgCliError::NoSamples);
    }
    Ok((buffer.snapshot(), stats))
}

async fn cmd_analyze(config: AppConfig, input: &Path, json: bool) -> Result<(), EcgCliError> {
    let (snapshot, stats) = load_recording(&config, input, config.stream.buffer_capacity).await?;
    let extractor = FeatureExtractor::new(config.features.clone());
    let quality = extractor.quality(&snapshot);
    let features = extractor.extract(&snapshot).map_err(EcgError::from)?;

    if json {
        let report = serde_json::json!({
            "ingest": stats,
            "features": features,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("ECG Analysis");
    println!("============");
    println!("Lines read:      {}", stats.lines);
    println!("Samples:         {} (window {})", stats.samples, features.sample_count);
    println!("Rejected lines:  {}", stats.rejected_total());
    println!("Duration:        {:.2} s", features.duration_s);
    println!("Sample rate:     {:.1} Hz", features.sample_rate_hz);
    match features.heart_rate_bpm {
        Some(hr) => println!("Heart rate:      {:.1} bpm", hr),
        None => println!("Heart rate:      n/a"),
    }
    println!("Peaks:           {}", features.peak_count());
    if let Some(hrv) = &features.hrv {
        println!(
            "HRV:             SDNN {:.1} ms, RMSSD {:.1} ms, {}",
            hrv.sdnn_ms,
            hrv.rmssd_ms,
            if hrv.rhythm_regular { "regular" } else { "irregular" }
        );
    }
    println!(
        "Quality:         {:.2} (density {:.2}, variance {:.2}, clipping {:.2})",
        quality.score, quality.density, quality.variance, quality.clipping
    );
    println!(
        "Voltage:         mean {:.1}, std {:.1}, range {:.1}..{:.1}",
        features.voltage.mean, features.voltage.std_dev, features.voltage.min, features.voltage.max
    );
    if stats.samples > snapshot.len() as u64 {
        println!(
            "\nOnly the last {} samples were analysed; use --windowed for the whole recording.",
            snapshot.len()
        );
    }
    Ok(())
}

async fn cmd_analyze_windows(config: AppConfig, input: &Path, json: bool) -> Result<(), EcgCliError> {
    let (snapshot, stats) = load_recording(&config, input, config.window.max_recording_samples).await?;
    let extractor = FeatureExtractor::new(config.features.clone());
    let windows = extractor.extract_windows(snapshot.samples(), &config.window);

    if json {
        let windows: Vec<serde_json::Value> = windows
            .iter()
            .map(|w| {
                serde_json::json!({
                    "window": w.window,
                    "start_sample": w.start_sample,
                    "end_sample": w.end_sample,
                    "features": w.result.as_ref().ok(),
                    "error": w.result.as_ref().err().map(ToString::to_string),
                })
            })
            .collect();
        let report = serde_json::json!({ "ingest": stats, "windows": windows });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("ECG Windowed Analysis");
    println!("=====================");
    println!(
        "Samples: {}, window {} samples, step {}",
        snapshot.len(),
        config.window.size,
        config.window.step()
    );
    for w in &windows {
        match &w.result {
            Ok(features) => println!(
                "  #{:<3} [{}..{}) HR {}, peaks {}, quality {:.2}",
                w.window,
                w.start_sample,
                w.end_sample,
                features
                    .heart_rate_bpm
                    .map(|hr| format!("{:.1} bpm", hr))
                    .unwrap_or_else(|| "n/a".to_string()),
                features.peak_count(),
                features.quality_score
            ),
            Err(e) => println!("  #{:<3} [{}..{}) {}", w.window, w.start_sample, w.end_sample, e),
        }
    }
    Ok(())
}

async fn cmd_diagnose(
    config: AppConfig,
    input: &Path,
    patient: Option<PatientContext>,
    json: bool,
) -> Result<(), EcgCliError> {
    let mut monitor = EcgMonitor::from_config(config)?;
    monitor.set_patient_context(patient);
    monitor.connect(open_input(input).await?);
    if let Some(stats) = monitor.wait().await {
        stats?;
    }

    monitor.trigger_diagnosis()?;
    monitor.orchestrator().wait_idle().await;

    let outcome = monitor.orchestrator().last_outcome();
    monitor.shutdown();

    let result = match outcome {
        Some(CycleOutcome::Succeeded(result)) => result,
        Some(CycleOutcome::Failed(failure)) => {
            return Err(EcgCliError::DiagnosisFailed(failure.message))
        }
        Some(CycleOutcome::Cancelled { .. }) | None => {
            return Err(EcgCliError::DiagnosisFailed("diagnosis was cancelled".to_string()))
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&*result)?);
        return Ok(());
    }

    println!("ECG Diagnosis (advisory)");
    println!("========================");
    println!("Conditions:  {}", result.ranked_conditions().join(", "));
    println!("Severity:    {}", result.severity);
    println!("Confidence:  {:.0}%", result.confidence * 100.0);
    if let Some(hr) = result.heart_rate_bpm {
        println!("Heart rate:  {:.1} bpm", hr);
    }
    print_list("Findings", &result.findings);
    print_list("Immediate actions", &result.recommendations.immediate_actions);
    print_list("Follow-up", &result.recommendations.follow_up);
    print_list("Lifestyle", &result.recommendations.lifestyle);
    print_list("Recommendations", &result.recommendations.general);
    print_list("Risk factors", &result.risk_factors);
    if let Some(prognosis) = &result.prognosis {
        println!("\nPrognosis: {}", prognosis);
    }
    if result.is_flagged() {
        println!("\nNote: the response was corrected while parsing ({:?})", result.flags);
    }
    Ok(())
}

async fn cmd_diagnose_windows(
    config: AppConfig,
    input: &Path,
    patient: Option<PatientContext>,
    json: bool,
) -> Result<(), EcgCliError> {
    let api_key = config.diagnosis.api_key().map_err(EcgError::from)?;
    let client = HttpDiagnosisClient::new(&config.diagnosis, api_key).map_err(EcgError::from)?;

    let (snapshot, _) = load_recording(&config, input, config.window.max_recording_samples).await?;
    let windows = FeatureExtractor::new(config.features.clone()).extract_windows(snapshot.samples(), &config.window);
    let results = diagnose_windows(&client, windows, patient, config.diagnosis.timeout()).await;

    if json {
        let windows: Vec<serde_json::Value> = results
            .iter()
            .map(|w| {
                serde_json::json!({
                    "window": w.window,
                    "start_sample": w.start_sample,
                    "end_sample": w.end_sample,
                    "diagnosis": w.outcome.as_ref().ok(),
                    "error": w.outcome.as_ref().err().map(ToString::to_string),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&windows)?);
    } else {
        println!("ECG Windowed Diagnosis (advisory)");
        println!("=================================");
        for w in &results {
            match &w.outcome {
                Ok(result) => println!(
                    "  #{:<3} [{}..{}) {} ({}, {:.0}%)",
                    w.window,
                    w.start_sample,
                    w.end_sample,
                    result.ranked_conditions().join(", "),
                    result.severity,
                    result.confidence * 100.0
                ),
                Err(e) => println!("  #{:<3} [{}..{}) failed: {}", w.window, w.start_sample, w.end_sample, e),
            }
        }
    }

    if results.iter().any(|w| w.outcome.is_ok()) {
        Ok(())
    } else {
        Err(EcgCliError::DiagnosisFailed("no window could be diagnosed".to_string()))
    }
}

fn print_list(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("\n{}:", title);
    for item in items {
        println!("  - {}", item);
    }
}

fn cmd_doctor(config: AppConfig, config_path: Option<&Path>, json: bool) -> Result<(), EcgCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "version".to_string(),
        status: CheckStatus::Ok,
        message: format!("{} {}", PRODUCER_NAME, VERSION),
    });

    checks.push(DoctorCheck {
        name: "config".to_string(),
        status: CheckStatus::Ok,
        message: match config_path {
            Some(path) => format!("Loaded {}", path.display()),
            None => "Using defaults and environment".to_string(),
        },
    });

    // Presence only; the value is never printed
    checks.push(match config.diagnosis.api_key() {
        Ok(_) => DoctorCheck {
            name: "api_key".to_string(),
            status: CheckStatus::Ok,
            message: format!("{} is set", config.diagnosis.api_key_env),
        },
        Err(_) => DoctorCheck {
            name: "api_key".to_string(),
            status: if config.diagnosis.auto_enabled {
                CheckStatus::Error
            } else {
                CheckStatus::Warning
            },
            message: format!(
                "{} is not set; diagnosis unavailable",
                config.diagnosis.api_key_env
            ),
        },
    });

    let endpoint = &config.diagnosis.endpoint;
    checks.push(DoctorCheck {
        name: "endpoint".to_string(),
        status: if endpoint.starts_with("https://") {
            CheckStatus::Ok
        } else {
            CheckStatus::Warning
        },
        message: format!(
            "{} ({}, timeout {} s)",
            endpoint,
            match config.diagnosis.protocol {
                EndpointProtocol::Direct => "direct",
                EndpointProtocol::ChatCompletions => "chat completions",
            },
            config.diagnosis.timeout_secs
        ),
    });

    checks.push(DoctorCheck {
        name: "stream".to_string(),
        status: CheckStatus::Ok,
        message: format!(
            "buffer {} samples, probe {} lines (cap {}), nominal {} Hz",
            config.stream.buffer_capacity,
            config.stream.probe_lines,
            config.stream.probe_cap,
            config.stream.nominal_sample_rate_hz
        ),
    });

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("ecgr Doctor Report");
        println!("==================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(EcgCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

// Error types

#[derive(Debug)]
enum EcgCliError {
    Io(io::Error),
    Ecg(EcgError),
    Json(serde_json::Error),
    Trigger(TriggerError),
    NoSamples,
    DiagnosisFailed(String),
    DoctorFailed,
}

impl From<io::Error> for EcgCliError {
    fn from(e: io::Error) -> Self {
        EcgCliError::Io(e)
    }
}

impl From<EcgError> for EcgCliError {
    fn from(e: EcgError) -> Self {
        EcgCliError::Ecg(e)
    }
}

impl From<serde_json::Error> for EcgCliError {
    fn from(e: serde_json::Error) -> Self {
        EcgCliError::Json(e)
    }
}

impl From<TriggerError> for EcgCliError {
    fn from(e: TriggerError) -> Self {
        EcgCliError::Trigger(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<EcgCliError> for CliError {
    fn from(e: EcgCliError) -> Self {
        match e {
            EcgCliError::Io(e) | EcgCliError::Ecg(EcgError::Io(e)) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            EcgCliError::Ecg(EcgError::Config(e)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'ecgr doctor' to inspect the configuration".to_string()),
            },
            EcgCliError::Ecg(EcgError::Feature(e)) => CliError {
                code: "INSUFFICIENT_DATA".to_string(),
                message: e.to_string(),
                hint: Some("Provide a longer recording".to_string()),
            },
            EcgCliError::Ecg(e) => CliError {
                code: "PIPELINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            EcgCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            EcgCliError::Trigger(e) => CliError {
                code: "TRIGGER_REFUSED".to_string(),
                message: e.to_string(),
                hint: Some("Provide a longer recording".to_string()),
            },
            EcgCliError::NoSamples => CliError {
                code: "NO_SAMPLES".to_string(),
                message: "No samples decoded from input".to_string(),
                hint: Some("Check the input format (DATA,... lines or bare numbers)".to_string()),
            },
            EcgCliError::DiagnosisFailed(message) => CliError {
                code: "DIAGNOSIS_FAILED".to_string(),
                message,
                hint: Some("Check the endpoint, API key and network".to_string()),
            },
            EcgCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
        }
    }
}

// Report types

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
