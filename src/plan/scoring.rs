//! Deterministic priority scoring, independent of the LLM.

use chrono::{DateTime, Utc};

use crate::types::Task;

/// Weighted score in [0, 1]:
/// 0.45·priority + 0.25·critical + 0.15·urgent + 0.10·energy fit + 0.05·recency.
pub fn priority_score(task: &Task, user_energy: u8, now: DateTime<Utc>) -> f64 {
    let priority = task.priority.weight();
    let critical = if task.is_critical { 1.0 } else { 0.0 };
    let urgent = if task.is_urgent { 1.0 } else { 0.0 };
    let energy = energy_fit(required_energy(task), user_energy);
    let recency = recency_score(task, now);

    let score = 0.45 * priority + 0.25 * critical + 0.15 * urgent + 0.10 * energy + 0.05 * recency;
    score.clamp(0.0, 1.0)
}

/// 1 − |required − user| / 4, clamped to [0, 1].
pub fn energy_fit(required: u8, user: u8) -> f64 {
    let diff = (required as f64 - user as f64).abs();
    (1.0 - diff / 4.0).clamp(0.0, 1.0)
}

/// Energy a task demands on the 1-5 scale, estimated from duration,
/// description length, and attendee count.
pub fn required_energy(task: &Task) -> u8 {
    let duration_mins = (task.end - task.start).num_minutes();
    let mut energy: i64 = if duration_mins > 60 {
        4
    } else if duration_mins > 30 {
        3
    } else if duration_mins < 15 {
        2
    } else {
        3
    };

    if task
        .description
        .as_deref()
        .map(|d| d.len() > 200)
        .unwrap_or(false)
    {
        energy += 1;
    }
    if !task.attendees.is_empty() {
        energy += 1;
    }

    energy.clamp(1, 5) as u8
}

/// Freshness of the task: 1.0 when just updated, linearly fading to 0 over
/// a week.
fn recency_score(task: &Task, now: DateTime<Utc>) -> f64 {
    let age_days = (now - task.updated_at).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / 7.0).clamp(0.0, 1.0)
}

/// Stable candidate ordering: score descending, then earlier original
/// start, then task id.
pub fn order_candidates(scored: &mut [(Task, f64, f64)]) {
    scored.sort_by(|(a, _, eff_a), (b, _, eff_b)| {
        eff_b
            .partial_cmp(eff_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.start.cmp(&b.start))
            .then_with(|| a.id.cmp(&b.id))
    });
}
