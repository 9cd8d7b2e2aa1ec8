use bumpalo::Bump;

/// MAD to Gaussian sigma conversion factor
pub const MAD_TO_SIGMA: f64 = 1.4826;

/// Output format of the `process` and `inspect` commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    /// Case-insensitive; anything unrecognized is shown as a table.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

pub fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Median of a slice that is already sorted.
fn sorted_median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Median of the finite values, `None` if there are none.
pub fn finite_median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let arena = Bump::new();
    let mut sorted = bumpalo::vec![in &arena];
    sorted.extend(values.into_iter().filter(|v| v.is_finite()));
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    Some(sorted_median(&sorted))
}

/// Median and median absolute deviation of the finite values.
pub fn median_and_mad(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    let arena = Bump::new();
    let mut sorted = bumpalo::vec![in &arena];
    sorted.extend(values.into_iter().filter(|v| v.is_finite()));
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let median = sorted_median(&sorted);

    let mut deviations = bumpalo::vec![in &arena];
    deviations.extend(sorted.iter().map(|v| (v - median).abs()));
    deviations.sort_unstable_by(|a, b| a.total_cmp(b));
    Some((median, sorted_median(&deviations)))
}

/// Result of iterative sigma clipping
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClippedStats {
    pub median: f64,
    pub std_dev: f64,
    /// Values surviving the final iteration
    pub count: usize,
}

/// Iteratively reject values further than `sigma` standard deviations from
/// the median, stopping after `max_iterations` or when nothing more is
/// rejected. Non-finite values are ignored.
pub fn sigma_clipped_stats(
    values: impl IntoIterator<Item = f64>,
    sigma: f64,
    max_iterations: usize,
) -> Option<ClippedStats> {
    let arena = Bump::new();
    let mut kept = bumpalo::vec![in &arena];
    kept.extend(values.into_iter().filter(|v| v.is_finite()));
    if kept.is_empty() {
        return None;
    }
    kept.sort_unstable_by(|a, b| a.total_cmp(b));

    let stats_of = |sorted: &[f64]| {
        let median = sorted_median(sorted);
        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let variance =
            sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / sorted.len() as f64;
        (median, variance.sqrt())
    };

    let (mut median, mut std_dev) = stats_of(&kept);
    for _ in 0..max_iterations {
        let low = median - sigma * std_dev;
        let high = median + sigma * std_dev;
        let before = kept.len();
        // Sorted input stays sorted under retain
        kept.retain(|v| *v >= low && *v <= high);
        if kept.is_empty() || kept.len() == before {
            break;
        }
        (median, std_dev) = stats_of(&kept);
    }

    Some(ClippedStats {
        median,
        std_dev,
        count: kept.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_output_format_ignores_case() {
        assert_eq!(OutputFormat::from_name("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_name("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_name("Csv"), OutputFormat::Csv);
        assert_eq!(OutputFormat::from_name("table"), OutputFormat::Table);
        assert_eq!(OutputFormat::from_name("xml"), OutputFormat::Table);
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("hello world", 8), "hello...");
        assert_eq!(truncate_string("abcd", 3), "...");
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("Vega"), "Vega");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_finite_median_ignores_nan() {
        assert_eq!(finite_median([3.0, f64::NAN, 1.0, 2.0]), Some(2.0));
        assert_eq!(finite_median([4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(finite_median([f64::NAN, f64::INFINITY]), None);
        assert_eq!(finite_median(std::iter::empty()), None);
    }

    #[test]
    fn test_median_and_mad() {
        let (median, mad) = median_and_mad([1.0, 1.0, 2.0, 2.0, 4.0, 6.0, 9.0]).unwrap();
        assert_relative_eq!(median, 2.0);
        assert_relative_eq!(mad, 1.0);
    }

    #[test]
    fn test_sigma_clipping_rejects_outliers() {
        let mut values: Vec<f64> = (0..100).map(|i| 100.0 + (i % 5) as f64).collect();
        values.extend([10_000.0, 25_000.0, -5_000.0]);

        let stats = sigma_clipped_stats(values, 3.0, 5).unwrap();
        assert_relative_eq!(stats.median, 102.0);
        assert!(stats.std_dev < 2.0);
        assert_eq!(stats.count, 100);
    }

    #[test]
    fn test_sigma_clipping_constant_values() {
        let stats = sigma_clipped_stats(vec![5.0; 16], 3.0, 5).unwrap();
        assert_eq!(stats.median, 5.0);
        assert_eq!(stats.std_dev, 0.0);
        assert_eq!(stats.count, 16);
    }
}
