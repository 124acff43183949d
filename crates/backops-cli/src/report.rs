use std::path::Path;

use backops_db::MigrationOutcome;
use backops_db::definitions::AdminRow;

/// One line per run, e.g. `add_last_login_column: skipped`.
pub fn outcome_line(name: &str, outcome: &MigrationOutcome) -> String {
    format!("{name}: {outcome}")
}

/// Read-only summary printed by `backops status`.
pub fn status_lines(db_path: &Path, has_last_login: bool, admins: &[AdminRow]) -> Vec<String> {
    let mut lines = vec![
        format!("database    {}", db_path.display()),
        format!(
            "last_login  {}",
            if has_last_login { "present" } else { "missing" }
        ),
    ];

    if admins.is_empty() {
        lines.push("admins      none".to_string());
        return lines;
    }

    lines.push(format!(
        "admins      {} row{}",
        admins.len(),
        if admins.len() == 1 { "" } else { "s" }
    ));
    let id_w = admins
        .iter()
        .map(|a| a.id.to_string().len())
        .max()
        .unwrap_or(1);
    for admin in admins {
        let role = admin.role.as_deref().unwrap_or("(no role)");
        lines.push(format!("  {:>id_w$}  {role}", admin.id));
    }
    lines
}
