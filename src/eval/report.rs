// Markdown-style report printing, the direct analogue of the original
// system's evaluation helper. The CLI layer is the only place allowed to
// write directly to stdout; everywhere else uses `tracing`.

use super::EvalReport;

pub fn print_report(report: &EvalReport) {
    println!("\n## Detection performance\n");
    println!("| Metric          | Value |");
    println!("|-----------------|-------|");
    println!("| True positives  | {} |", report.overall.true_positive);
    println!("| False positives | {} |", report.overall.false_positive);
    println!("| True negatives  | {} |", report.overall.true_negative);
    println!("| False negatives | {} |", report.overall.false_negative);
    println!("| Precision       | {:.4} |", report.overall.precision());
    println!("| Recall          | {:.4} |", report.overall.recall());

    if report.per_host.len() > 1 {
        println!("\n### Per-host\n");
        println!("| Host | TP | FP | TN | FN | Precision | Recall |");
        println!("|------|----|----|----|----|-----------|--------|");
        let mut hosts: Vec<_> = report.per_host.iter().collect();
        hosts.sort_by_key(|(host, _)| **host);
        for (host, counts) in hosts {
            println!(
                "| {} | {} | {} | {} | {} | {:.4} | {:.4} |",
                host,
                counts.true_positive,
                counts.false_positive,
                counts.true_negative,
                counts.false_negative,
                counts.precision(),
                counts.recall()
            );
        }
    }
}
