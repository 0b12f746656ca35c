//! Top command implementation

use anyhow::Result;

use crate::store::AggregateStore;

pub fn run(store: &AggregateStore, first_party: Option<String>, limit: usize) -> Result<()> {
    let rows = store.top_apis(first_party.as_deref(), limit)?;

    if rows.is_empty() {
        println!("No API calls recorded. Run 'domtally run' or 'domtally analyze' first.");
        return Ok(());
    }

    println!(
        "{:>10} {:>7}  {:<30} {:<30} {}",
        "Calls", "Scripts", "First party", "Script origin", "API"
    );
    println!("{}", "-".repeat(110));

    for row in rows {
        println!(
            "{:>10} {:>7}  {:<30} {:<30} {}",
            row.calls,
            row.scripts,
            truncate(&row.first_party_origin, 30),
            truncate(&row.script_origin, 30),
            row.api,
        );
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.is_empty() {
        return "-".to_string();
    }
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("", 10), "-");
        assert_eq!(truncate("https://a.test", 30), "https://a.test");
        assert_eq!(truncate("https://very-long-origin.test", 10), "https:/...");
    }
}
