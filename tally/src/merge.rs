//! Find-or-append merge of metric updates into a snapshot.
//!
//! Backends that hold the whole metric set in one list (the file backend,
//! snapshot restore) fold updates in with [`apply`]; a batch is folded with
//! [`apply_all`] and then persisted once, which is what makes it atomic.

use crate::metric::Metric;

/// Applies one update to `entries`.
///
/// The entry with the same `(id, kind)` is merged per
/// [`MetricValue::merge`](crate::metric::MetricValue::merge); if there is
/// none, the update is appended as a new entry.
pub fn apply(entries: &mut Vec<Metric>, update: &Metric) {
    match entries.iter_mut().find(|m| m.is(&update.id, update.kind())) {
        Some(existing) => {
            existing.value.merge(update.value);
        }
        None => entries.push(update.clone()),
    }
}

/// Applies every update in order.
pub fn apply_all(entries: &mut Vec<Metric>, updates: &[Metric]) {
    for update in updates {
        apply(entries, update);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_appends_unseen() {
        let mut entries = Vec::new();
        apply(&mut entries, &Metric::gauge("Alloc", 1.0));
        apply(&mut entries, &Metric::counter("Alloc", 2));
        assert_eq!(
            entries,
            vec![Metric::gauge("Alloc", 1.0), Metric::counter("Alloc", 2)]
        );
    }

    #[test]
    fn test_apply_merges_existing() {
        let mut entries = vec![Metric::gauge("Alloc", 1.0), Metric::counter("Poll", 2)];
        apply(&mut entries, &Metric::gauge("Alloc", 7.5));
        apply(&mut entries, &Metric::counter("Poll", 3));
        assert_eq!(
            entries,
            vec![Metric::gauge("Alloc", 7.5), Metric::counter("Poll", 5)]
        );
    }

    #[test]
    fn test_apply_all_with_repeats_in_batch() {
        let mut entries = vec![Metric::counter("Poll", 1), Metric::gauge("Untouched", 9.0)];
        apply_all(
            &mut entries,
            &[
                Metric::counter("Poll", 2),
                Metric::counter("Poll", 3),
                Metric::gauge("New", 1.0),
                Metric::gauge("New", 2.0),
            ],
        );
        assert_eq!(
            entries,
            vec![
                Metric::counter("Poll", 6),
                Metric::gauge("Untouched", 9.0),
                Metric::gauge("New", 2.0),
            ]
        );
    }
}
