//! CSV output format

use crate::protocol::{Outcome, RunReport};

pub fn csv_header() -> &'static str {
    "run_id,protocol,connection,status,duration_secs,bytes,bits_per_second,success_rate\n"
}

/// One row per connection
pub fn output_csv(report: &RunReport) -> String {
    let mut output = String::from(csv_header());

    for result in &report.results {
        let status = match result.outcome {
            Outcome::Completed => "completed",
            Outcome::Failed { .. } => "failed",
        };
        output.push_str(&format!(
            "{},{},{},{},{:.6},{},{:.2},{}\n",
            report.id,
            result.protocol,
            result.connection,
            status,
            result.duration_secs,
            result.bytes,
            result.bits_per_second,
            result
                .packet_success_rate()
                .map(|r| format!("{:.4}", r))
                .unwrap_or_default(),
        ));
    }

    output
}
