use std::fmt::Write;

use chrono::NaiveDateTime;

use crate::matching::Recommendations;
use crate::models::{Student, TeamRoster};

/// A student without a team and the peers they might pair up with.
pub struct OpenStudent {
    pub student: Student,
    pub recommendations: Recommendations,
}

pub fn build_report(
    generated_at: NaiveDateTime,
    capacity: usize,
    rosters: &[TeamRoster],
    open: &[OpenStudent],
    top: usize,
) -> String {
    let mut output = String::new();
    let placed: usize = rosters.iter().map(|r| r.members.len()).sum();

    let _ = writeln!(output, "# Roommate Matching Report");
    let _ = writeln!(
        output,
        "Generated {} ({} teams, {} students placed, {} unaffiliated)",
        generated_at.format("%Y-%m-%d %H:%M"),
        rosters.len(),
        placed,
        open.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Teams");

    if rosters.is_empty() {
        let _ = writeln!(output, "No teams formed yet.");
    } else {
        for roster in rosters {
            let label = roster.team.description.as_deref().unwrap_or("no description");
            let _ = writeln!(
                output,
                "- Team {} ({}, {}/{} members): {}",
                roster.team.id,
                roster.team.gender,
                roster.members.len(),
                capacity,
                label
            );
            for member in &roster.members {
                let _ = writeln!(output, "  - {} ({})", member.name, member.id);
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Unaffiliated Students");

    if open.is_empty() {
        let _ = writeln!(output, "Every student has a team.");
        return output;
    }

    for entry in open {
        let _ = writeln!(
            output,
            "- {} ({}, {})",
            entry.student.name, entry.student.id, entry.student.gender
        );
        let scored = &entry.recommendations.scored;
        if scored.is_empty() {
            let _ = writeln!(output, "  - no scored matches yet");
            continue;
        }
        for rec in scored.iter().take(top) {
            let _ = writeln!(
                output,
                "  - {} ({}) score {:.2}",
                rec.name,
                rec.student_id,
                rec.score.unwrap_or_default()
            );
        }
    }

    output
}
