use anyhow::{anyhow, bail, Context, Result};
use beatfix_lib::{
    config::{load_parameters, ProcessingParameters, Species},
    detectors::peaks::{AutoLower, KeepThreshold, ThresholdConfirm},
    io::{csv as csv_io, text as text_io},
    metrics::rate::{sliding_rate, summarize, RateSummary, RateUnit},
    pipeline::{Pipeline, ProjectionReport},
    plot::{figure_from_rate, figure_from_signal, Figure, PlotBackend, Series},
    ranges::merge_spans,
    session::{load_session, save_session, SessionRecord},
    signal::{Recording, Span},
    simulate::{synthetic_ecg, SimulationConfig},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;
use plotters::prelude::*;
use serde::Serialize;
use std::{
    io::{self, Read},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

#[derive(Parser)]
#[command(
    name = "beatfix",
    version,
    about = "Heartbeat extraction and correction for ECG recordings"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SpeciesArg {
    Mouse,
    Human,
}

impl From<SpeciesArg> for Species {
    fn from(value: SpeciesArg) -> Self {
        match value {
            SpeciesArg::Mouse => Species::Mouse,
            SpeciesArg::Human => Species::Human,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum UnitArg {
    Hz,
    Bpm,
}

impl From<UnitArg> for RateUnit {
    fn from(value: UnitArg) -> Self {
        match value {
            UnitArg::Hz => RateUnit::Hz,
            UnitArg::Bpm => RateUnit::Bpm,
        }
    }
}

#[derive(Args)]
struct InputArgs {
    /// Samples, one per line (or `time value` pairs); stdin when omitted.
    /// A `.csv` file is read by column name.
    #[arg(long)]
    input: Option<PathBuf>,
    /// Sampling rate for single-column input
    #[arg(long)]
    fs: Option<f64>,
    #[arg(long, default_value = "time")]
    time_column: String,
    #[arg(long, default_value = "ecg")]
    value_column: String,
}

#[derive(Args)]
struct ParamArgs {
    #[arg(long, value_enum, default_value_t = SpeciesArg::Mouse)]
    species: SpeciesArg,
    /// TOML parameter file laid over the species preset
    #[arg(long)]
    params: Option<PathBuf>,
    /// Parameter override, e.g. `--set threshold=12`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
    /// Lower an unusable threshold instead of failing
    #[arg(long)]
    auto_lower_threshold: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a species preset as TOML
    Presets {
        #[arg(long, value_enum, default_value_t = SpeciesArg::Mouse)]
        species: SpeciesArg,
    },
    /// Preprocess and detect candidate beats; prints a JSON summary
    Detect {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        params: ParamArgs,
    },
    /// Run preprocessing, detection and projection; prints a JSON summary
    Process {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        params: ParamArgs,
        /// Removed window `START:END` (s); repeatable
        #[arg(long = "remove", value_name = "START:END")]
        remove: Vec<String>,
        /// Write the curation session as JSON
        #[arg(long)]
        session: Option<PathBuf>,
        /// Write corrected beat times, one per line
        #[arg(long)]
        beats_out: Option<PathBuf>,
        /// Render the processed signal with beats to PNG
        #[arg(long)]
        plot: Option<PathBuf>,
    },
    /// Sliding-window heart rate from beat times, as CSV
    Rate {
        /// Beat times (s), one per line; stdin when omitted
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long, default_value_t = 2.0)]
        window: f64,
        #[arg(long, value_enum, default_value_t = UnitArg::Bpm)]
        unit: UnitArg,
        /// Excluded span `START:END` (s); repeatable
        #[arg(long = "exclude", value_name = "START:END")]
        exclude: Vec<String>,
        /// CSV destination; stdout when omitted
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Render the heart rate stored in a session to PNG
    PlotRate {
        #[arg(long)]
        session: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = UnitArg::Bpm)]
        unit: UnitArg,
    },
    /// Write a synthetic recording with known beat times
    Simulate {
        #[arg(long)]
        out: PathBuf,
        /// True beat times, one per line
        #[arg(long)]
        beats_out: Option<PathBuf>,
        #[arg(long, default_value_t = 2000.0)]
        fs: f64,
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
        /// Mean beat rate (Hz)
        #[arg(long, default_value_t = 10.0)]
        rate: f64,
        #[arg(long, default_value_t = 0.02)]
        jitter: f64,
        #[arg(long, default_value_t = 0.01)]
        noise: f64,
        #[arg(long, default_value_t = 0)]
        spurious: usize,
        /// Square artefact `START:END` (s)
        #[arg(long, value_name = "START:END")]
        artefact: Option<String>,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
}

#[derive(Serialize)]
struct DetectSummary {
    raw_fs: f64,
    processing_fs: f64,
    threshold: f64,
    threshold_lowered: bool,
    peaks: usize,
    template_members: usize,
    template: Vec<f64>,
    artefacts: Vec<Span>,
    rate: Option<RateSummary>,
    beats: Vec<f64>,
}

#[derive(Serialize)]
struct ProcessSummary {
    raw_fs: f64,
    processing_fs: f64,
    threshold: f64,
    detected: usize,
    projection: ProjectionReport,
    artefacts: Vec<Span>,
    removed_windows: Vec<Span>,
    rate: Option<RateSummary>,
    beats: Vec<f64>,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Presets { species } => cmd_presets(species)?,
        Commands::Detect { input, params } => cmd_detect(&input, &params)?,
        Commands::Process {
            input,
            params,
            remove,
            session,
            beats_out,
            plot,
        } => cmd_process(
            &input,
            &params,
            &remove,
            session.as_deref(),
            beats_out.as_deref(),
            plot.as_deref(),
        )?,
        Commands::Rate {
            input,
            window,
            unit,
            exclude,
            out,
        } => cmd_rate(input.as_deref(), window, unit, &exclude, out.as_deref())?,
        Commands::PlotRate { session, out, unit } => cmd_plot_rate(&session, &out, unit)?,
        Commands::Simulate {
            out,
            beats_out,
            fs,
            duration,
            rate,
            jitter,
            noise,
            spurious,
            artefact,
            seed,
        } => {
            let config = SimulationConfig {
                fs,
                duration,
                rate,
                jitter,
                noise_std: noise,
                spurious_beats: spurious,
                artefact: artefact.as_deref().map(parse_span).transpose()?,
                seed,
                ..Default::default()
            };
            cmd_simulate(&config, &out, beats_out.as_deref())?
        }
    }
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}

fn load_recording(args: &InputArgs) -> Result<Recording> {
    match &args.input {
        Some(path)
            if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv")) =>
        {
            csv_io::read_recording_csv(path, &args.time_column, &args.value_column)
        }
        Some(path) => text_io::read_recording(path, args.fs),
        None => text_io::parse_recording(&read_stdin()?, args.fs),
    }
}

fn resolve_parameters(args: &ParamArgs) -> Result<ProcessingParameters> {
    let base = match &args.params {
        Some(path) => load_parameters(path)?,
        None => ProcessingParameters::preset(args.species.into()),
    };
    Ok(base.with_assignments(&args.set)?)
}

fn confirmation(args: &ParamArgs) -> &'static dyn ThresholdConfirm {
    if args.auto_lower_threshold {
        &AutoLower
    } else {
        &KeepThreshold
    }
}

/// Parse `START:END` seconds.
fn parse_span(text: &str) -> Result<Span> {
    let (start, end) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("expected START:END, got '{}'", text))?;
    let start: f64 = start.trim().parse().with_context(|| format!("bad start in '{}'", text))?;
    let end: f64 = end.trim().parse().with_context(|| format!("bad end in '{}'", text))?;
    if !(start.is_finite() && end.is_finite()) {
        bail!("span '{}' is not finite", text);
    }
    Ok(Span::new(start, end))
}

fn cmd_presets(species: SpeciesArg) -> Result<()> {
    print!("{}", ProcessingParameters::preset(species.into()).to_toml()?);
    Ok(())
}

fn cmd_detect(input: &InputArgs, params: &ParamArgs) -> Result<()> {
    let recording = load_recording(input)?;
    let raw_fs = recording.fs;
    let mut pipeline = Pipeline::new(recording, resolve_parameters(params)?)?;
    pipeline.detect(confirmation(params))?;
    let detection = pipeline
        .detection()
        .ok_or_else(|| anyhow!("detection produced no result"))?;
    let summary = DetectSummary {
        raw_fs,
        processing_fs: detection.fs,
        threshold: detection.threshold,
        threshold_lowered: detection.threshold_lowered,
        peaks: detection.peaks.len(),
        template_members: detection.template_members,
        template: detection.template.values.clone(),
        artefacts: pipeline.artefacts().to_vec(),
        rate: summarize(pipeline.rate()),
        beats: pipeline.beats().to_vec(),
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_process(
    input: &InputArgs,
    params: &ParamArgs,
    remove: &[String],
    session: Option<&Path>,
    beats_out: Option<&Path>,
    plot: Option<&Path>,
) -> Result<()> {
    let recording = load_recording(input)?;
    let raw_fs = recording.fs;
    let mut pipeline = Pipeline::new(recording, resolve_parameters(params)?)?;
    pipeline.detect(confirmation(params))?;
    for text in remove {
        let span = parse_span(text)?;
        pipeline.add_removed_window(span.start, span.end);
    }
    let detected = pipeline.beats().len();
    let report = pipeline.project(&AtomicBool::new(false))?;

    if let Some(path) = session {
        let source = input.input.as_deref().unwrap_or_else(|| Path::new("-"));
        save_session(path, &SessionRecord::capture(&pipeline, source)?)?;
    }
    if let Some(path) = beats_out {
        text_io::write_beats(path, pipeline.beats())?;
    }
    if let Some(path) = plot {
        let signal = pipeline
            .signal()
            .ok_or_else(|| anyhow!("no processed signal to plot"))?;
        let fig = figure_from_signal(
            "Processed ECG",
            signal,
            pipeline.beats(),
            &pipeline.exclusions(),
            4096,
        );
        PngBackend::new(path).draw(&fig)?;
    }

    let summary = ProcessSummary {
        raw_fs,
        processing_fs: pipeline.signal().map_or(raw_fs, |s| s.fs),
        threshold: pipeline.params().threshold,
        detected,
        projection: report,
        artefacts: pipeline.artefacts().to_vec(),
        removed_windows: pipeline.removed_windows().to_vec(),
        rate: summarize(pipeline.rate()),
        beats: pipeline.beats().to_vec(),
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_rate(
    input: Option<&Path>,
    window: f64,
    unit: UnitArg,
    exclude: &[String],
    out: Option<&Path>,
) -> Result<()> {
    if !(window > 0.0) {
        bail!("window must be positive, got {}", window);
    }
    let beats = match input {
        Some(path) => text_io::parse_beats(
            &std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        )?,
        None => text_io::parse_beats(&read_stdin()?)?,
    };
    let exclusions = exclude
        .iter()
        .map(|s| parse_span(s))
        .collect::<Result<Vec<_>>>()?;
    let rate = sliding_rate(&beats, window, &merge_spans(&exclusions));
    match out {
        Some(path) => csv_io::write_rate_csv(path, &rate, unit.into())?,
        None => csv_io::write_rate(io::stdout().lock(), &rate, unit.into())?,
    }
    Ok(())
}

fn cmd_plot_rate(session: &Path, out: &Path, unit: UnitArg) -> Result<()> {
    let record = load_session(session)?;
    let (params, notes) = ProcessingParameters::from_stored(&record.parameters)?;
    for note in notes {
        log::warn!("{}", note);
    }
    let mut exclusions = record.artefacts.clone();
    exclusions.extend_from_slice(&record.removed_windows);
    let rate = sliding_rate(
        &record.heart_beats,
        params.sliding_window,
        &merge_spans(&exclusions),
    );
    if rate.iter().all(|p| p.rate.is_none()) {
        bail!("session {} has no defined heart rate to plot", session.display());
    }
    let fig = figure_from_rate(&rate, unit.into(), 2048);
    PngBackend::new(out).draw(&fig)?;
    info!("wrote {}", out.display());
    Ok(())
}

fn cmd_simulate(config: &SimulationConfig, out: &Path, beats_out: Option<&Path>) -> Result<()> {
    let sim = synthetic_ecg(config);
    let mut text = String::with_capacity(sim.recording.len() * 10);
    for v in &sim.recording.data {
        text.push_str(&format!("{:.6}\n", v));
    }
    std::fs::write(out, text).with_context(|| format!("failed to write {}", out.display()))?;
    if let Some(path) = beats_out {
        text_io::write_beats(path, &sim.beats)?;
    }
    println!(
        "{}",
        serde_json::json!({
            "samples": sim.recording.len(),
            "fs": sim.recording.fs,
            "beats": sim.beats.len(),
            "spurious": sim.spurious.len(),
        })
    );
    Ok(())
}

/// PNG rendering through plotters' bitmap backend.
struct PngBackend<'a> {
    path: &'a Path,
    size: (u32, u32),
}

impl<'a> PngBackend<'a> {
    fn new(path: &'a Path) -> Self {
        Self {
            path,
            size: (1200, 480),
        }
    }
}

fn rgb(color: beatfix_lib::plot::Color) -> RGBColor {
    let (r, g, b) = color.rgb();
    RGBColor(r, g, b)
}

impl PlotBackend for PngBackend<'_> {
    fn draw(&mut self, fig: &Figure) -> Result<()> {
        let root = BitMapBackend::new(self.path, self.size).into_drawing_area();
        root.fill(&WHITE)?;
        let (x_min, x_max, y_min, y_max) = fig.bounds().unwrap_or((0.0, 1.0, 0.0, 1.0));
        let mut chart = ChartBuilder::on(&root)
            .margin(10)
            .caption(
                fig.title.clone().unwrap_or_else(|| "Plot".into()),
                ("sans-serif", 24),
            )
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(x_min..x_max, y_min..y_max)?;
        chart
            .configure_mesh()
            .x_desc(fig.x.label.clone().unwrap_or_default())
            .y_desc(fig.y.label.clone().unwrap_or_default())
            .draw()?;
        for series in &fig.series {
            match series {
                Series::Bands(bands) => {
                    let fill = rgb(bands.color).mix(0.4).filled();
                    chart.draw_series(bands.spans.iter().map(|s| {
                        Rectangle::new([(s.start, y_min), (s.end, y_max)], fill)
                    }))?;
                }
                Series::Line(line) => {
                    chart.draw_series(plotters::series::LineSeries::new(
                        line.points.iter().map(|p| (p[0], p[1])),
                        rgb(line.style.color).stroke_width(line.style.width.round() as u32),
                    ))?;
                }
                Series::Markers(markers) => {
                    let fill = rgb(markers.color).filled();
                    chart.draw_series(
                        markers
                            .points
                            .iter()
                            .map(|p| Circle::new((p[0], p[1]), markers.size, fill)),
                    )?;
                }
            }
        }
        root.present()?;
        Ok(())
    }
}
