//! Plain text output

use crate::protocol::{Outcome, RunReport, TransferResult};
use crate::stats::{ProtocolSummary, RunSummary, bps_to_human, bytes_to_human};

/// One line for a finished connection
pub fn output_result_line(result: &TransferResult) -> String {
    match &result.outcome {
        Outcome::Completed => {
            let mut line = format!(
                "{} transfer #{} finished, total time: {:.2} seconds, total speed: {}",
                result.protocol,
                result.connection,
                result.duration_secs,
                bps_to_human(result.bits_per_second)
            );
            if let Some(rate) = result.packet_success_rate() {
                line.push_str(&format!(
                    ", percentage of packets received successfully: {:.1}%",
                    rate * 100.0
                ));
            }
            line
        }
        Outcome::Failed { reason } => format!(
            "{} transfer #{} failed after {:.2} seconds: {}",
            result.protocol, result.connection, result.duration_secs, reason
        ),
    }
}

fn push_summary(output: &mut String, label: &str, summary: &ProtocolSummary) {
    if summary.connections == 0 {
        return;
    }
    output.push_str(&format!(
        "  {}: {} connection(s), {} failed\n",
        label, summary.connections, summary.failed
    ));
    output.push_str(&format!(
        "    Transfer:    {}\n",
        bytes_to_human(summary.bytes)
    ));
    output.push_str(&format!(
        "    Aggregate:   {}\n",
        bps_to_human(summary.aggregate_bits_per_second)
    ));
    output.push_str(&format!(
        "    Mean:        {}\n",
        bps_to_human(summary.mean_bits_per_second)
    ));
    output.push_str(&format!("    Longest:     {:.2}s\n", summary.longest_secs));
    if let Some(rate) = summary.mean_success_rate {
        output.push_str(&format!("    Delivered:   {:.1}%\n", rate * 100.0));
    }
}

pub fn output_plain(report: &RunReport) -> String {
    let mut output = String::new();

    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push_str("  dualspeed Results\n");
    output.push_str("─".repeat(60).as_str());
    output.push('\n');
    output.push('\n');

    output.push_str(&format!("  Server:      {}\n", report.server));
    output.push_str(&format!(
        "  File size:   {}\n",
        bytes_to_human(report.file_size)
    ));
    output.push('\n');

    for result in &report.results {
        output.push_str("  ");
        output.push_str(&output_result_line(result));
        output.push('\n');
    }
    output.push('\n');

    let summary = RunSummary::from_results(&report.results);
    push_summary(&mut output, "TCP", &summary.tcp);
    push_summary(&mut output, "UDP", &summary.udp);
    output.push('\n');

    output.push_str("─".repeat(60).as_str());
    output.push('\n');

    output
}
