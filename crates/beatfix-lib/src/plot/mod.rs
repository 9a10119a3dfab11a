//! Backend-neutral figure descriptions for signals, beats and rate traces.

use crate::{
    metrics::rate::{RatePoint, RateUnit},
    signal::{PreprocessedSignal, Span},
};
use serde::{Deserialize, Serialize};

pub const SIGNAL_COLOR: u32 = 0x1F4E79;
pub const BEAT_COLOR: u32 = 0xD62728;
pub const RATE_COLOR: u32 = 0xFF0077;
pub const EXCLUSION_COLOR: u32 = 0xBBBBBB;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Axis {
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Style {
    pub width: f32,
    pub dash: Option<[f32; 2]>,
    pub color: Color,
}

impl Style {
    pub fn solid(width: f32, color: u32) -> Self {
        Self {
            width,
            dash: None,
            color: Color(color),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub u32);

impl Color {
    pub fn rgb(self) -> (u8, u8, u8) {
        (
            ((self.0 >> 16) & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            (self.0 & 0xFF) as u8,
        )
    }
}

/// Polyline in data coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub style: Style,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerSeries {
    pub name: String,
    pub points: Vec<[f64; 2]>,
    pub size: u32,
    pub color: Color,
}

/// Shaded time interval spanning the full y range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSeries {
    pub name: String,
    pub spans: Vec<Span>,
    pub color: Color,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Series {
    Line(LineSeries),
    Markers(MarkerSeries),
    Bands(BandSeries),
}

impl Series {
    /// Data points, used to fit axes. Bands only contribute x extents.
    pub fn extent_points(&self) -> Vec<[f64; 2]> {
        match self {
            Series::Line(line) => line.points.clone(),
            Series::Markers(markers) => markers.points.clone(),
            Series::Bands(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    pub title: Option<String>,
    pub x: Axis,
    pub y: Axis,
    pub series: Vec<Series>,
}

impl Figure {
    pub fn new(title: impl Into<Option<String>>) -> Self {
        Self {
            title: title.into(),
            x: Axis::default(),
            y: Axis::default(),
            series: Vec::new(),
        }
    }

    pub fn with_labels(mut self, x: &str, y: &str) -> Self {
        self.x.label = Some(x.into());
        self.y.label = Some(y.into());
        self
    }

    pub fn add_series(&mut self, series: Series) {
        self.series.push(series);
    }

    /// `(x_min, x_max, y_min, y_max)` over every point, or `None` when empty.
    pub fn bounds(&self) -> Option<(f64, f64, f64, f64)> {
        let mut points = self.series.iter().flat_map(Series::extent_points).peekable();
        points.peek()?;
        let mut b = (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for [x, y] in points {
            b.0 = b.0.min(x);
            b.1 = b.1.max(x);
            b.2 = b.2.min(y);
            b.3 = b.3.max(y);
        }
        if b.1 <= b.0 {
            b.1 = b.0 + 1.0;
        }
        if b.3 <= b.2 {
            b.3 = b.2 + 1.0;
        }
        Some(b)
    }
}

pub trait PlotBackend {
    fn draw(&mut self, fig: &Figure) -> anyhow::Result<()>;
}

pub fn decimate_points(points: &[[f64; 2]], max_points: usize) -> Vec<[f64; 2]> {
    if points.len() <= max_points || max_points == 0 {
        return points.to_vec();
    }
    let bucket_size = points.len() as f64 / max_points as f64;
    (0..max_points)
        .map(|i| (i as f64 * bucket_size).floor() as usize)
        .take_while(|&start| start < points.len())
        .map(|start| points[start])
        .collect()
}

/// Rate trace with masked entries left out.
pub fn figure_from_rate(rate: &[RatePoint], unit: RateUnit, max_points: usize) -> Figure {
    let points: Vec<[f64; 2]> = rate
        .iter()
        .filter_map(|p| p.rate.map(|r| [p.time, unit.express(r)]))
        .collect();
    let mut fig = Figure::new(Some("Heart rate".into()))
        .with_labels("time (s)", &format!("rate ({})", unit.label()));
    fig.add_series(Series::Line(LineSeries {
        name: "rate".into(),
        points: decimate_points(&points, max_points),
        style: Style::solid(2.0, RATE_COLOR),
    }));
    fig
}

/// Processed signal with beat markers and shaded exclusion spans.
pub fn figure_from_signal(
    title: &str,
    signal: &PreprocessedSignal,
    beats: &[f64],
    exclusions: &[Span],
    max_points: usize,
) -> Figure {
    let points: Vec<[f64; 2]> = signal
        .samples
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.map(|v| [signal.time_at(i), v]))
        .collect();
    let markers: Vec<[f64; 2]> = beats
        .iter()
        .filter_map(|&t| {
            let idx = signal.index_of(t);
            signal.samples.get(idx).copied().flatten().map(|v| [t, v])
        })
        .collect();
    let mut fig = Figure::new(Some(title.into())).with_labels("time (s)", "amplitude");
    if !exclusions.is_empty() {
        fig.add_series(Series::Bands(BandSeries {
            name: "excluded".into(),
            spans: exclusions.to_vec(),
            color: Color(EXCLUSION_COLOR),
        }));
    }
    fig.add_series(Series::Line(LineSeries {
        name: title.into(),
        points: decimate_points(&points, max_points),
        style: Style::solid(1.4, SIGNAL_COLOR),
    }));
    fig.add_series(Series::Markers(MarkerSeries {
        name: "beats".into(),
        points: markers,
        size: 3,
        color: Color(BEAT_COLOR),
    }));
    fig
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimation_keeps_bucket_starts() {
        let points: Vec<[f64; 2]> = (0..10).map(|i| [i as f64, 0.0]).collect();
        let out = decimate_points(&points, 4);
        let xs: Vec<f64> = out.iter().map(|p| p[0]).collect();
        assert_eq!(xs, vec![0.0, 2.0, 5.0, 7.0]);
        assert_eq!(decimate_points(&points, 20).len(), 10);
    }

    #[test]
    fn rate_figure_skips_masked_points() {
        let rate = [
            RatePoint { time: 0.0, rate: None },
            RatePoint { time: 1.0, rate: Some(1.0) },
            RatePoint { time: 2.0, rate: Some(1.5) },
        ];
        let fig = figure_from_rate(&rate, RateUnit::Bpm, 100);
        let Series::Line(line) = &fig.series[0] else {
            panic!("expected a line");
        };
        assert_eq!(line.points, vec![[1.0, 60.0], [2.0, 90.0]]);
        assert_eq!(fig.bounds(), Some((1.0, 2.0, 60.0, 90.0)));
    }

    #[test]
    fn signal_figure_marks_beats_on_valid_samples() {
        let signal = PreprocessedSignal {
            fs: 10.0,
            start_time: 0.0,
            samples: vec![Some(0.0), Some(1.0), None, Some(0.5)],
            artefacts: Vec::new(),
            decimation: 1,
        };
        let fig = figure_from_signal("ecg", &signal, &[0.1, 0.2], &[Span::new(0.15, 0.25)], 100);
        assert_eq!(fig.series.len(), 3);
        let Series::Markers(markers) = &fig.series[2] else {
            panic!("expected markers");
        };
        assert_eq!(markers.points, vec![[0.1, 1.0]]);
        assert_eq!(Color(0x102030).rgb(), (0x10, 0x20, 0x30));
    }
}
