// src/chart.rs

use anyhow::{anyhow, Result};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::FontTransform;
use std::ops::Range;
use std::path::Path;
use tracing::info;

use crate::output::ensure_parent;
use crate::reports::stats;

const SIZE: (u32, u32) = (1200, 700);

type DrawResult = std::result::Result<(), Box<dyn std::error::Error>>;

/// Render into an SVG file at `path`.
fn render<F>(path: &Path, draw: F) -> Result<()>
where
    F: FnOnce(&DrawingArea<SVGBackend<'_>, Shift>) -> DrawResult,
{
    ensure_parent(path)?;
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|e| anyhow!("chart rendering failed: {:?}", e))?;
    draw(&root).map_err(|e| anyhow!("chart rendering failed for {}: {}", path.display(), e))?;
    root.present()
        .map_err(|e| anyhow!("chart rendering failed: {:?}", e))?;
    info!("Wrote chart {}", path.display());
    Ok(())
}

/// Value range padded by 5% each side, always containing zero when `with_zero`.
fn padded_range(values: impl Iterator<Item = f64>, with_zero: bool) -> Range<f64> {
    let (mut lo, mut hi) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return 0.0..1.0;
    }
    if with_zero {
        lo = lo.min(0.0);
        hi = hi.max(0.0);
    }
    let span = hi - lo;
    let pad = if span > 0.0 { span * 0.05 } else { hi.abs().max(1.0) * 0.05 };
    (lo - pad)..(hi + pad)
}

/// Category axis: index `i` sits at `i as f64`.
fn category_range(n: usize) -> Range<f64> {
    -0.5..(n.max(1) as f64 - 0.5)
}

fn category_label(labels: &[String], x: f64) -> String {
    let i = x.round();
    if (x - i).abs() > 1e-6 || i < 0.0 {
        return String::new();
    }
    labels.get(i as usize).cloned().unwrap_or_default()
}

fn short(label: &str, max: usize) -> String {
    if label.chars().count() <= max {
        label.to_string()
    } else {
        let cut: String = label.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    }
}

/// One line per series over categorical x values. Missing points break the line.
pub fn line_chart(
    path: &Path,
    title: &str,
    x_labels: &[String],
    series: &[(String, Vec<Option<f64>>)],
    y_desc: &str,
) -> Result<()> {
    let y_range = padded_range(series.iter().flat_map(|(_, v)| v.iter().flatten().copied()), true);
    render(path, |root| {
        let mut chart = ChartBuilder::on(root)
            .caption(title, ("sans-serif", 24).into_font())
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(100)
            .build_cartesian_2d(category_range(x_labels.len()), y_range)?;
        let fmt = |x: &f64| category_label(x_labels, *x);
        chart
            .configure_mesh()
            .x_labels(x_labels.len().max(1))
            .x_label_formatter(&fmt)
            .y_desc(y_desc)
            .draw()?;

        for (i, (name, values)) in series.iter().enumerate() {
            let color = Palette99::pick(i).to_rgba();
            let points: Vec<(f64, f64)> = values
                .iter()
                .enumerate()
                .filter_map(|(x, v)| v.map(|v| (x as f64, v)))
                .collect();
            chart
                .draw_series(LineSeries::new(points.clone(), color.stroke_width(2)))?
                .label(short(name, 40))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            chart.draw_series(PointSeries::of_element(
                points,
                4,
                color.filled(),
                &|c, s, st| EmptyElement::at(c) + Circle::new((0, 0), s, st),
            ))?;
        }
        if series.len() > 1 {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }
        Ok(())
    })
}

/// Vertical bars, one per label.
pub fn bar_chart(path: &Path, title: &str, labels: &[String], values: &[f64], y_desc: &str) -> Result<()> {
    grouped_bar_chart(path, title, labels, &[(String::new(), values.to_vec())], y_desc)
}

/// Side-by-side bars: every group contributes one bar per label.
pub fn grouped_bar_chart(
    path: &Path,
    title: &str,
    labels: &[String],
    groups: &[(String, Vec<f64>)],
    y_desc: &str,
) -> Result<()> {
    let y_range = padded_range(groups.iter().flat_map(|(_, v)| v.iter().copied()), true);
    let short_labels: Vec<String> = labels.iter().map(|l| short(l, 18)).collect();
    render(path, |root| {
        let mut chart = ChartBuilder::on(root)
            .caption(title, ("sans-serif", 24).into_font())
            .margin(20)
            .x_label_area_size(if labels.len() > 8 { 160 } else { 50 })
            .y_label_area_size(100)
            .build_cartesian_2d(category_range(labels.len()), y_range)?;
        let fmt = |x: &f64| category_label(&short_labels, *x);
        let mut mesh = chart.configure_mesh();
        mesh.disable_x_mesh()
            .x_labels(labels.len().max(1))
            .x_label_formatter(&fmt)
            .y_desc(y_desc);
        if labels.len() > 8 {
            mesh.x_label_style(
                ("sans-serif", 12)
                    .into_font()
                    .transform(FontTransform::Rotate90),
            );
        }
        mesh.draw()?;

        let n = groups.len().max(1) as f64;
        let width = 0.8 / n;
        for (g, (name, values)) in groups.iter().enumerate() {
            let color = Palette99::pick(g).to_rgba();
            let left = -0.4 + g as f64 * width;
            let bars = values.iter().enumerate().filter(|(_, v)| v.is_finite()).map(|(i, v)| {
                let x0 = i as f64 + left;
                Rectangle::new([(x0, 0.0), (x0 + width, *v)], color.filled())
            });
            let drawn = chart.draw_series(bars)?;
            if !name.is_empty() {
                drawn.label(name.as_str()).legend(move |(x, y)| {
                    Rectangle::new([(x, y - 5), (x + 15, y + 5)], color.filled())
                });
            }
        }
        if groups.iter().any(|(n, _)| !n.is_empty()) {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }
        Ok(())
    })
}

/// Scatter of `points` with `highlighted` drawn on top in red.
pub fn scatter_chart(
    path: &Path,
    title: &str,
    points: &[(f64, f64)],
    highlighted: &[(f64, f64)],
    x_desc: &str,
    y_desc: &str,
) -> Result<()> {
    let all = || points.iter().chain(highlighted);
    let x_range = padded_range(all().map(|p| p.0), false);
    let y_range = padded_range(all().map(|p| p.1), false);
    render(path, |root| {
        let mut chart = ChartBuilder::on(root)
            .caption(title, ("sans-serif", 24).into_font())
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(80)
            .build_cartesian_2d(x_range, y_range)?;
        chart.configure_mesh().x_desc(x_desc).y_desc(y_desc).draw()?;

        chart
            .draw_series(points.iter().map(|p| Circle::new(*p, 4, BLUE.mix(0.5).filled())))?
            .label("organisations")
            .legend(|(x, y)| Circle::new((x + 8, y), 4, BLUE.mix(0.5).filled()));
        if !highlighted.is_empty() {
            chart
                .draw_series(highlighted.iter().map(|p| Circle::new(*p, 6, RED.filled())))?
                .label("outliers")
                .legend(|(x, y)| Circle::new((x + 8, y), 6, RED.filled()));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
        Ok(())
    })
}

/// Equal-width bin counts over `[min, max]`; the last bin is closed.
pub fn bin_counts(values: &[f64], bins: usize) -> Vec<(f64, f64, usize)> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let bins = bins.max(1);
    let (Some(lo), Some(hi)) = (
        finite.iter().copied().reduce(f64::min),
        finite.iter().copied().reduce(f64::max),
    ) else {
        return Vec::new();
    };
    let width = if hi > lo { (hi - lo) / bins as f64 } else { 1.0 };
    let mut counts = vec![0usize; bins];
    for v in &finite {
        let i = (((v - lo) / width) as usize).min(bins - 1);
        counts[i] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, c)| (lo + i as f64 * width, lo + (i + 1) as f64 * width, c))
        .collect()
}

/// Histogram with dashed mean and median markers.
pub fn histogram(path: &Path, title: &str, values: &[f64], bins: usize, x_desc: &str) -> Result<()> {
    let counts = bin_counts(values, bins);
    let x_range = padded_range(counts.iter().flat_map(|(a, b, _)| [*a, *b]), false);
    let y_max = counts.iter().map(|c| c.2).max().unwrap_or(1) as f64 * 1.1;
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let markers = [
        ("mean", stats::mean(&finite), RED),
        ("median", stats::median(&finite), GREEN),
    ];
    render(path, |root| {
        let mut chart = ChartBuilder::on(root)
            .caption(title, ("sans-serif", 24).into_font())
            .margin(20)
            .x_label_area_size(50)
            .y_label_area_size(60)
            .build_cartesian_2d(x_range, 0.0..y_max.max(1.0))?;
        chart
            .configure_mesh()
            .x_desc(x_desc)
            .y_desc("Number of organisations")
            .draw()?;

        chart.draw_series(counts.iter().map(|(a, b, c)| {
            Rectangle::new([(*a, 0.0), (*b, *c as f64)], BLUE.mix(0.6).filled())
        }))?;
        for (name, at, color) in markers {
            let Some(at) = at else { continue };
            let segments = (0..20).map(|k| {
                let y0 = y_max * k as f64 / 20.0;
                PathElement::new(vec![(at, y0), (at, y0 + y_max / 40.0)], color.stroke_width(2))
            });
            chart
                .draw_series(segments)?
                .label(format!("{} {:.2}", name, at))
                .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
        }
        chart
            .configure_series_labels()
            .background_style(WHITE.mix(0.8))
            .border_style(BLACK)
            .draw()?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn bins_cover_range_and_count_everything() {
        let bins = bin_counts(&[0.0, 1.0, 2.0, 3.0, 4.0, f64::NAN], 4);
        assert_eq!(bins.len(), 4);
        assert_eq!(bins[0].0, 0.0);
        assert_eq!(bins[3].1, 4.0);
        assert_eq!(bins.iter().map(|b| b.2).sum::<usize>(), 5);
        assert_eq!(bins[3].2, 2);
        assert!(bin_counts(&[], 5).is_empty());
    }

    #[test]
    fn category_labels_only_on_integers() {
        let labels = vec!["2021-22".to_string(), "2022-23".to_string()];
        assert_eq!(category_label(&labels, 1.0), "2022-23");
        assert_eq!(category_label(&labels, 0.5), "");
        assert_eq!(category_label(&labels, 5.0), "");
    }

    #[test]
    fn renders_svg_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let years = vec!["2021-22".to_string(), "2022-23".to_string()];

        let line = dir.path().join("line.svg");
        line_chart(&line, "Trend", &years, &[("IT".into(), vec![Some(1.0), None])], "£")?;
        let bars = dir.path().join("nested/bars.svg");
        grouped_bar_chart(
            &bars,
            "Combined",
            &years,
            &[("IT".into(), vec![1.0, 2.0]), ("Consultancy".into(), vec![-1.0, 3.0])],
            "£",
        )?;
        let hist = dir.path().join("hist.svg");
        histogram(&hist, "Distribution", &[1.0, 2.0, 2.0, 9.0], 5, "%")?;
        let scatter = dir.path().join("scatter.svg");
        scatter_chart(&scatter, "Size", &[(1.0, 2.0), (2.0, 3.0)], &[(9.0, 9.0)], "x", "y")?;

        for p in [line, bars, hist, scatter] {
            assert!(fs::read_to_string(&p)?.contains("<svg"), "{}", p.display());
        }
        Ok(())
    }
}
