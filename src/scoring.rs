use crate::timeline::ChordTimeline;

/// Overlap score of a predicted timeline against a reference.
///
/// Both timelines are swept with two pointers. Each predicted interval that
/// overlaps the current reference interval, and whose label is contained in
/// the reference label, adds the fraction of the reference interval it covers.
/// The sum is divided by the number of reference intervals visited. Several
/// predicted intervals may cover the same reference interval, so the result
/// is not bounded by 1.
pub fn score(predicted: &ChordTimeline, reference: &ChordTimeline) -> f64 {
    let pred = predicted.intervals();
    let refs = reference.intervals();
    if pred.is_empty() || refs.is_empty() {
        return 0.0;
    }

    let mut matched = 0.0;
    let mut total = 1.0;
    let (mut p, mut r) = (0, 0);

    while p < pred.len() && r < refs.len() {
        let pi = &pred[p];
        let ri = &refs[r];

        if pi.stop <= ri.start {
            p += 1;
        } else if pi.start >= ri.stop {
            r += 1;
            if r < refs.len() {
                total += 1.0;
            }
        } else {
            if ri.label.contains(pi.label.as_str()) {
                let ref_len = ri.duration();
                matched += if pi.start <= ri.start {
                    if pi.stop <= ri.stop {
                        (pi.stop - ri.start) / ref_len
                    } else {
                        1.0
                    }
                } else if pi.stop <= ri.stop {
                    pi.duration() / ref_len
                } else {
                    (ri.stop - pi.start) / ref_len
                };
            }
            p += 1;
        }
    }

    log::trace!("score: matched {:.3} over {} reference intervals", matched, total);
    matched / total
}
