const RULE_WIDTH: usize = 55;

/// Frame status lines for the log, title between double rules
pub fn format_boxed(title: &str, lines: &[String]) -> String {
    let heavy = "═".repeat(RULE_WIDTH);
    let mut out = String::with_capacity((lines.len() + 4) * (RULE_WIDTH + 1));

    out.push_str(&heavy);
    out.push('\n');
    out.push_str(&format!("  {}\n", title));
    out.push_str(&heavy);
    out.push('\n');
    for line in lines {
        out.push_str(&format!("  {}\n", line));
    }
    out.push_str(&"─".repeat(RULE_WIDTH));
    out
}
