//! Simulation statistics collection and reporting.
//!
//! Counters are owned by the units that increment them; at end of run the
//! core enumerates everything into an ordered key/value table so drivers can
//! print or export it without knowing the counter set.

/// An ordered table of statistic name/value pairs.
pub type StatsTable = Vec<(String, String)>;

/// Formats a ratio as a fixed-precision string, guarding division by zero.
pub fn ratio(num: u64, den: u64) -> String {
    if den == 0 {
        return "0.00".to_string();
    }
    format!("{:.2}", num as f64 / den as f64)
}

/// Formats a percentage as a fixed-precision string, guarding division by zero.
pub fn percentage(num: u64, den: u64) -> String {
    if den == 0 {
        return "0.000%".to_string();
    }
    format!("{:.3}%", 100.0 * num as f64 / den as f64)
}

/// Prints a statistics table to stdout, aligned on the key column.
pub fn print(table: &StatsTable) {
    let width = table.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in table {
        println!("{:width$}  {}", key, value, width = width);
    }
}
