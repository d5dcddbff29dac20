//! Recurrence collapse: one upcoming occurrence per recurring series.

use std::collections::HashMap;

use crate::event::CalendarEvent;

/// Reduces each recurring series in `events` to its earliest-starting member.
///
/// Events without a series id pass through untouched. On equal start times
/// the first one in fetch order wins. Retained events keep their relative
/// order from the input.
pub fn collapse(events: Vec<CalendarEvent>) -> Vec<CalendarEvent> {
    // series id -> index of the current winner in `events`
    let mut winners: HashMap<&str, usize> = HashMap::new();
    for (idx, event) in events.iter().enumerate() {
        let Some(series) = event.recurring_series_id.as_deref() else {
            continue;
        };
        winners
            .entry(series)
            .and_modify(|best| {
                if event.start_time < events[*best].start_time {
                    *best = idx;
                }
            })
            .or_insert(idx);
    }

    let keep: Vec<bool> = events
        .iter()
        .enumerate()
        .map(|(idx, event)| match event.recurring_series_id.as_deref() {
            Some(series) => winners.get(series) == Some(&idx),
            None => true,
        })
        .collect();

    let before = events.len();
    let collapsed: Vec<CalendarEvent> = events
        .into_iter()
        .zip(keep)
        .filter_map(|(event, keep)| keep.then_some(event))
        .collect();

    if collapsed.len() != before {
        tracing::debug!(before, after = collapsed.len(), "collapsed recurring series");
    }
    collapsed
}
