//! Display formatting for CLI output
//!
//! SBIO pattern: Pure functions that format data for display

use super::commands::{ProvisionedTenant, ValidationSummary};
use crate::scenario::{Outcome, ScenarioReport};
use crate::topology::TeardownSummary;

// ============================================================================
// Table formatting helpers
// ============================================================================

/// Format a simple table with headers and rows
pub fn format_table(headers: &[&str], rows: Vec<Vec<String>>) -> String {
    if rows.is_empty() {
        return "No resources found.\n".to_string();
    }

    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut output = String::new();
    let mut push_row = |cells: Vec<String>| {
        let line: Vec<String> = cells
            .iter()
            .enumerate()
            .map(|(i, cell)| match widths.get(i) {
                Some(width) => format!("{:width$}", cell, width = *width),
                None => cell.clone(),
            })
            .collect();
        output.push_str(line.join("   ").trim_end());
        output.push('\n');
    };

    push_row(headers.iter().map(|h| h.to_uppercase()).collect());
    for row in rows {
        push_row(row);
    }
    output
}

// ============================================================================
// Validation display
// ============================================================================

pub fn format_validation(path: &str, summaries: &[ValidationSummary]) -> String {
    let rows = summaries
        .iter()
        .map(|s| {
            vec![
                s.tenant.clone(),
                s.routers.to_string(),
                s.networks.to_string(),
                s.security_groups.to_string(),
                s.servers.to_string(),
                if s.gateway { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    format!(
        "✓ {} is valid\n\n{}",
        path,
        format_table(
            &["tenant", "routers", "networks", "security groups", "servers", "gateway"],
            rows
        )
    )
}

// ============================================================================
// Endpoint display
// ============================================================================

/// One row per provisioned server, failed tenants listed below the table
pub fn format_provisioned(tenants: &[ProvisionedTenant]) -> String {
    let rows = tenants
        .iter()
        .flat_map(|t| {
            t.endpoints.iter().map(move |e| {
                let addresses: Vec<&str> =
                    e.interfaces.iter().map(|i| i.address.as_str()).collect();
                vec![
                    t.tenant.clone(),
                    e.name().to_string(),
                    format!("{:?}", e.role).to_lowercase(),
                    addresses.join(","),
                    e.public_address().unwrap_or("-").to_string(),
                ]
            })
        })
        .collect();
    let mut output = format_table(&["tenant", "server", "role", "addresses", "floating ip"], rows);
    for tenant in tenants {
        if let Some(error) = &tenant.error {
            output.push_str(&format!("✗ {}: {}\n", tenant.tenant, error));
        }
    }
    output
}

pub fn format_teardown(summaries: &[(String, TeardownSummary)]) -> String {
    let rows = summaries
        .iter()
        .map(|(tenant, s)| {
            vec![
                tenant.clone(),
                s.executed.to_string(),
                s.already_absent.to_string(),
                s.failed.to_string(),
            ]
        })
        .collect();
    format_table(&["tenant", "deleted", "already gone", "failed"], rows)
}

// ============================================================================
// Report display
// ============================================================================

pub fn format_report(report: &ScenarioReport) -> String {
    let mut output = String::new();
    let status = match &report.outcome {
        Outcome::Passed => "✓ PASSED".to_string(),
        Outcome::Failed { reason } => format!("✗ FAILED: {}", reason),
        Outcome::Skipped { reason } => format!("- SKIPPED: {}", reason),
        Outcome::Running => "… RUNNING".to_string(),
    };
    output.push_str(&format!("{} [{}] {}\n", report.scenario, report.tenant, status));
    if let Some(secs) = report.duration_secs() {
        output.push_str(&format!("  duration: {:.1}s\n", secs));
    }
    for check in &report.checks {
        output.push_str(&format!("  - {}\n", check));
    }
    for batch in &report.batches {
        output.push_str(&format!("  {}: {}\n", batch.label, batch.counters));
    }
    if let Some(teardown) = &report.teardown {
        output.push_str(&format!(
            "  teardown: {} deleted, {} already gone, {} failed\n",
            teardown.executed, teardown.already_absent, teardown.failed
        ));
    }
    output
}

pub fn format_reports(reports: &[ScenarioReport]) -> String {
    reports.iter().map(format_report).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb::Counters;
    use crate::scenario::ScenarioKind;

    #[test]
    fn test_format_table_alignment() {
        let table = format_table(
            &["name", "count"],
            vec![
                vec!["a".to_string(), "1".to_string()],
                vec!["longer".to_string(), "22".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "NAME     COUNT");
        assert_eq!(lines[1], "a        1");
        assert_eq!(lines[2], "longer   22");
    }

    #[test]
    fn test_format_table_empty() {
        assert_eq!(format_table(&["name"], vec![]), "No resources found.\n");
    }

    #[test]
    fn test_format_report_lists_batches() {
        let mut report = ScenarioReport::new(ScenarioKind::LbaasRoundRobin, "demo");
        report.record_check("VIP answered from backend-1");
        report.record_batch(
            "round-robin",
            &Counters::from_pairs([("backend-1", 13), ("backend-2", 12)]),
        );
        report.finish(Ok(()));
        let text = format_report(&report);
        assert!(text.starts_with("lbaas-round-robin [demo] ✓ PASSED"));
        assert!(text.contains("round-robin: {backend-1: 13, backend-2: 12, failures: 0}"));
        assert!(text.contains("- VIP answered from backend-1"));
    }

    #[test]
    fn test_format_teardown() {
        let summary = TeardownSummary {
            executed: 7,
            already_absent: 1,
            failed: 0,
        };
        let text = format_teardown(&[("demo".to_string(), summary)]);
        assert!(text.contains("demo"));
        assert!(text.contains("7"));
    }
}
