//! ASCII bar rendering for distribution diagnostics.

/// Renders per-frame counts as a column chart, `rows` high. Counts are
/// scaled so the tallest column fills the chart; a zero or oversized `rows`
/// leaves counts unscaled.
#[must_use]
pub fn render_bars(counts: &[u32], rows: usize) -> String {
    if counts.is_empty() {
        return String::new();
    }
    let max = counts.iter().copied().max().unwrap_or(0);
    if max == 0 {
        return String::new();
    }

    let scale = if rows == 0 || rows as u32 > max {
        1.0
    } else {
        rows as f64 / f64::from(max)
    };
    let height = if rows == 0 { max as usize } else { rows };
    let scaled: Vec<usize> = counts
        .iter()
        .map(|c| (f64::from(*c) * scale).round() as usize)
        .collect();

    let mut out = String::with_capacity((counts.len() + 1) * height);
    for level in (1..=height).rev() {
        for &column in &scaled {
            out.push(if column >= level { '#' } else { '.' });
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_scaled_columns() {
        let chart = render_bars(&[0, 2, 4], 2);
        let lines: Vec<&str> = chart.lines().collect();
        assert_eq!(lines, vec!["..#", ".##"]);
    }

    #[test]
    fn empty_input_renders_nothing() {
        assert!(render_bars(&[], 5).is_empty());
        assert!(render_bars(&[0, 0], 5).is_empty());
    }
}
