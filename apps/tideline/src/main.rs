use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;

use tideline::progress::{ProgressKind, ProgressSink};
use tideline::recording::{EncodingChoice, FileFormat};
use tideline::session::Session;
use tideline::source;
use tideline::telemetry::logging::{self, LogConfig, LogLevel};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EncodingArg {
    Auto,
    Utf8,
    Ibm,
    Latin1,
}

impl From<EncodingArg> for EncodingChoice {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Auto => EncodingChoice::Auto,
            EncodingArg::Utf8 => EncodingChoice::Utf8,
            EncodingArg::Ibm => EncodingChoice::Ibm,
            EncodingArg::Latin1 => EncodingChoice::Latin1,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FormatArg {
    Ttyrec,
    Ttyrec2,
    Script,
}

impl From<FormatArg> for FileFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Ttyrec => FileFormat::Ttyrec,
            FormatArg::Ttyrec2 => FileFormat::MultistreamTtyrec,
            FormatArg::Script => FileFormat::Script,
        }
    }
}

fn parse_size(s: &str) -> Result<(u16, u16), String> {
    let (cols, rows) = s
        .split_once('x')
        .ok_or_else(|| "expected COLSxROWS, e.g. 80x24".to_string())?;
    let cols: u16 = cols
        .trim()
        .parse()
        .map_err(|_| format!("bad column count {cols:?}"))?;
    let rows: u16 = rows
        .trim()
        .parse()
        .map_err(|_| format!("bad row count {rows:?}"))?;
    if cols == 0 || rows == 0 {
        return Err("size must be nonzero".into());
    }
    Ok((cols, rows))
}

#[derive(Parser, Debug)]
#[command(name = "tideline", about = "Ingest and decode terminal session recordings")]
struct Cli {
    /// Path or URL of the recording (file, http(s), tcp, telnet, termcast,
    /// dgamelaunch).
    uri: String,

    /// Keep reading a local file that is still being written.
    #[arg(long)]
    follow: bool,

    /// Character encoding to decode with.
    #[arg(long, value_enum, default_value = "auto")]
    encoding: EncodingArg,

    /// Fixed terminal size as COLSxROWS, disabling automatic growth.
    #[arg(long, value_parser = parse_size)]
    size: Option<(u16, u16)>,

    /// Skip container detection and force a framing.
    #[arg(long, value_enum)]
    format: Option<FormatArg>,

    #[arg(long, value_enum, default_value = "warn", env = "TIDELINE_LOG_LEVEL")]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "TIDELINE_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Default)]
struct CliSink {
    fatal: AtomicBool,
}

impl ProgressSink for CliSink {
    fn ingestion_started(&self) {
        info!(target: "tideline", "ingestion started");
    }

    fn progress(&self, kind: ProgressKind, units: u64) {
        info!(target: "tideline", stage = kind.label(), units, "progress");
    }

    fn ingestion_complete(&self) {
        info!(target: "tideline", "ingestion complete");
    }

    fn fatal_input_failure(&self, message: &str) {
        eprintln!("tideline: {message}");
        self.fatal.store(true, Ordering::Release);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    }) {
        eprintln!("tideline: {err}");
        return ExitCode::from(1);
    }

    let byte_source = match source::open_source(&cli.uri, cli.follow) {
        Ok(byte_source) => byte_source,
        Err(err) => {
            eprintln!("tideline: unrecognized input {}: {err}", cli.uri);
            return ExitCode::from(1);
        }
    };

    let session = Session::start(byte_source);
    let sink = Arc::new(CliSink::default());
    session.subscribe_progress(sink.clone());

    let mut failed = false;
    if let Some(size) = cli.size {
        failed |= session.set_forced_size(Some(size)).is_err();
    }
    if let Err(err) = session.set_encoding(cli.encoding.into()) {
        eprintln!("tideline: {err}");
        failed = true;
    }
    if let Some(format) = cli.format {
        failed |= session.set_file_format(format.into()).is_err();
    }
    if failed {
        session.complete_cancel();
        return ExitCode::from(1);
    }

    // a live stream never completes; keep ingesting until the peer hangs up
    while !session.wait_until_complete(Duration::from_secs(1)) {}

    let recording = session.recording();
    let format = recording
        .file_format()
        .map(FileFormat::label)
        .unwrap_or("unknown");
    let frames = session.frame_count();
    let size = frames
        .checked_sub(1)
        .and_then(|last| session.frame(last))
        .and_then(|frame| frame.terminal)
        .map(|term| format!("{}x{}", term.cols(), term.rows()))
        .unwrap_or_else(|| "-".into());
    println!(
        "{}: {} frame(s), {:.3}s, format {}, encoding {:?}, final size {}",
        cli.uri,
        frames,
        session.length(),
        format,
        recording.actual_encoding(),
        size,
    );

    session.complete_cancel();
    if sink.fatal.load(Ordering::Acquire) {
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
