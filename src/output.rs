use std::fs::File;
use std::io::Write;

use anyhow::Result;
use log::info;

use crate::simulator::SimulationResult;

/// Scientific notation with six significant digits, the one numeric format
/// every output surface uses.
pub fn format_value(x: f64) -> String {
    format!("{x:.5e}")
}

/// CSV header: key column first, then the ordered unknown names.
pub fn csv_header(key_column: &str, names: &[String]) -> String {
    let mut line = String::from(key_column);
    for name in names {
        line.push(',');
        line.push_str(name);
    }
    line
}

/// One CSV data row.
pub fn csv_row(key: f64, values: &[f64]) -> String {
    let mut line = format_value(key);
    for v in values {
        line.push(',');
        line.push_str(&format_value(*v));
    }
    line
}

/// Unit tag for a labeled dump line, inferred from the unknown's name.
fn unit_for(name: &str) -> &'static str {
    match name.chars().next() {
        Some('V') => "V",
        Some('I') => "A",
        _ => "",
    }
}

/// Operating-point dump: one `name = value unit` line per unknown.
pub fn print_op_dump(names: &[String], values: &[f64]) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for (name, v) in names.iter().zip(values) {
        let _ = writeln!(out, "{:<15} = {:>13} {}", name, format_value(*v), unit_for(name));
    }
}

/// Export the collected result as CSV through the csv crate.
pub fn export_csv(result: &SimulationResult, path: &str) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::Writer::from_writer(file);

    let mut header = vec![result.key_column.clone()];
    header.extend(result.columns.iter().cloned());
    writer.write_record(&header)?;

    for (key, values) in &result.rows {
        let mut record = vec![format_value(*key)];
        record.extend(values.iter().map(|v| format_value(*v)));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    info!("results exported to CSV: {path}");
    Ok(())
}

/// Export the collected result as pretty JSON.
pub fn export_json(result: &SimulationResult, path: &str) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, result)?;
    info!("results exported to JSON: {path}");
    Ok(())
}
