//! Myers' O(ND) difference algorithm over byte slices.
//!
//! Linear-space divide and conquer: [`Context::diag`] runs the forward and
//! reverse searches simultaneously until they overlap on a diagonal (the
//! middle snake), and [`Context::compareseq`] recurses on both halves.
//!
//! Unless a minimal script is requested, two heuristics bound the cost for
//! near-unrelated inputs:
//!
//! - after 200 edit steps, a diagonal that made a lot of progress and ends
//!   in a snake of at least `SNAKE_LIMIT` bytes is accepted as the split;
//! - once the edit cost reaches `too_expensive` (about the square root of
//!   the input size, at least 4096), the search gives up and splits at the
//!   furthest point reached so far.
//!
//! Both only affect where the problem is split, so the resulting script may
//! be longer than necessary but always transforms A into B.
//!
//! With an edit ceiling, a box is abandoned as soon as its search shows it
//! needs more edits than the ceiling has left, so a hopeless diff costs
//! about `ceiling` steps per box rather than a full search.

use thiserror::Error;
use tracing::debug;

use crate::script::{EditOp, EditScript};

/// Minimum length of a snake the progress heuristic insists on.
const SNAKE_LIMIT: isize = 20;

/// Lower bound of the default cost limit.
const MIN_TOO_EXPENSIVE: isize = 4096;

/// Returned when the script would need more edits than allowed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("edit script exceeds {limit} edits")]
pub struct DiffTooLarge {
    pub limit: usize,
}

/// Tuning knobs for [`diff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Use the progress heuristic for long, sparse edits.
    pub heuristic: bool,
    /// Always find a shortest script (disables both heuristics).
    pub minimal: bool,
    /// Give up with [`DiffTooLarge`] beyond this many inserted plus deleted bytes.
    pub max_edits: Option<usize>,
    /// Override the edit cost at which a search gives up on optimality.
    pub too_expensive: Option<usize>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            heuristic: true,
            minimal: false,
            max_edits: None,
            too_expensive: None,
        }
    }
}

impl DiffOptions {
    pub fn minimal() -> Self {
        Self {
            minimal: true,
            ..Self::default()
        }
    }

    pub fn with_max_edits(mut self, max_edits: usize) -> Self {
        self.max_edits = Some(max_edits);
        self
    }
}

/// Compute an edit script turning `a` into `b`.
pub fn diff(a: &[u8], b: &[u8], options: DiffOptions) -> Result<EditScript, DiffTooLarge> {
    let max_edits = options.max_edits.unwrap_or(usize::MAX);
    let mut ctx = Context::new(a, b, options);

    let aborted = ctx.compareseq(0, a.len() as isize, 0, b.len() as isize, options.minimal);
    if aborted {
        debug!(
            base = a.len(),
            target = b.len(),
            limit = max_edits,
            "diff exceeded edit ceiling"
        );
        return Err(DiffTooLarge { limit: max_edits });
    }

    Ok(build_script(a, b, &ctx.deleted, &ctx.inserted))
}

struct Partition {
    xmid: isize,
    ymid: isize,
    lo_minimal: bool,
    hi_minimal: bool,
}

struct Context<'a> {
    a: &'a [u8],
    b: &'a [u8],
    /// Furthest-reaching x per diagonal, forward search.
    fdiag: Vec<isize>,
    /// Furthest-reaching x per diagonal, reverse search.
    bdiag: Vec<isize>,
    /// Shift so that diagonal `-(|b| + 1)` lands at index 0.
    offset: isize,
    too_expensive: isize,
    heuristic: bool,
    deleted: Vec<bool>,
    inserted: Vec<bool>,
    edits: usize,
    max_edits: usize,
}

impl<'a> Context<'a> {
    fn new(a: &'a [u8], b: &'a [u8], options: DiffOptions) -> Self {
        let diags = a.len() + b.len() + 3;

        let too_expensive = match options.too_expensive {
            Some(limit) => limit.max(1) as isize,
            None => {
                let mut limit: isize = 1;
                let mut rest = diags;
                while rest != 0 {
                    limit <<= 1;
                    rest >>= 2;
                }
                limit.max(MIN_TOO_EXPENSIVE)
            }
        };

        Self {
            a,
            b,
            fdiag: vec![0; diags],
            bdiag: vec![0; diags],
            offset: b.len() as isize + 1,
            too_expensive,
            heuristic: options.heuristic,
            deleted: vec![false; a.len()],
            inserted: vec![false; b.len()],
            edits: 0,
            max_edits: options.max_edits.unwrap_or(usize::MAX),
        }
    }

    /// Returns true once the edit ceiling is exceeded.
    fn note_delete(&mut self, x: isize) -> bool {
        self.deleted[x as usize] = true;
        self.edits += 1;
        self.edits > self.max_edits
    }

    fn note_insert(&mut self, y: isize) -> bool {
        self.inserted[y as usize] = true;
        self.edits += 1;
        self.edits > self.max_edits
    }

    /// Mark the edits between `a[xoff..xlim]` and `b[yoff..ylim]`.
    /// Returns true if the edit ceiling was hit.
    fn compareseq(
        &mut self,
        mut xoff: isize,
        mut xlim: isize,
        mut yoff: isize,
        mut ylim: isize,
        find_minimal: bool,
    ) -> bool {
        let (a, b) = (self.a, self.b);

        while xoff < xlim && yoff < ylim && a[xoff as usize] == b[yoff as usize] {
            xoff += 1;
            yoff += 1;
        }
        while xoff < xlim && yoff < ylim && a[(xlim - 1) as usize] == b[(ylim - 1) as usize] {
            xlim -= 1;
            ylim -= 1;
        }

        if xoff == xlim {
            while yoff < ylim {
                if self.note_insert(yoff) {
                    return true;
                }
                yoff += 1;
            }
        } else if yoff == ylim {
            while xoff < xlim {
                if self.note_delete(xoff) {
                    return true;
                }
                xoff += 1;
            }
        } else {
            let part = match self.diag(xoff, xlim, yoff, ylim, find_minimal) {
                Some(part) => part,
                None => return true,
            };
            if self.compareseq(xoff, part.xmid, yoff, part.ymid, part.lo_minimal) {
                return true;
            }
            if self.compareseq(part.xmid, xlim, part.ymid, ylim, part.hi_minimal) {
                return true;
            }
        }
        false
    }

    /// Find the midpoint of the shortest edit script for the given box.
    ///
    /// Returns `None` once the box alone is known to need more edits than
    /// the ceiling has left.
    fn diag(
        &mut self,
        xoff: isize,
        xlim: isize,
        yoff: isize,
        ylim: isize,
        find_minimal: bool,
    ) -> Option<Partition> {
        let (a, b) = (self.a, self.b);
        let budget = self.max_edits.saturating_sub(self.edits);
        let off = self.offset;
        let heuristic = self.heuristic;
        let too_expensive = self.too_expensive;
        let fd = &mut self.fdiag;
        let bd = &mut self.bdiag;

        let at = |d: isize| (d + off) as usize;
        let eq = |x: isize, y: isize| a[x as usize] == b[y as usize];

        let dmin = xoff - ylim;
        let dmax = xlim - yoff;
        let fmid = xoff - yoff;
        let bmid = xlim - ylim;
        let (mut fmin, mut fmax) = (fmid, fmid);
        let (mut bmin, mut bmax) = (bmid, bmid);
        let odd = (fmid - bmid) & 1 != 0;

        fd[at(fmid)] = xoff;
        bd[at(bmid)] = xlim;

        let mut c: isize = 1;
        loop {
            let mut big_snake = false;

            // Extend the forward search by one edit on every diagonal.
            if fmin > dmin {
                fmin -= 1;
                fd[at(fmin - 1)] = -1;
            } else {
                fmin += 1;
            }
            if fmax < dmax {
                fmax += 1;
                fd[at(fmax + 1)] = -1;
            } else {
                fmax -= 1;
            }
            let mut d = fmax;
            while d >= fmin {
                let tlo = fd[at(d - 1)];
                let thi = fd[at(d + 1)];
                let x0 = if tlo < thi { thi } else { tlo + 1 };
                let mut x = x0;
                let mut y = x0 - d;
                while x < xlim && y < ylim && eq(x, y) {
                    x += 1;
                    y += 1;
                }
                if x - x0 > SNAKE_LIMIT {
                    big_snake = true;
                }
                fd[at(d)] = x;
                if odd && bmin <= d && d <= bmax && bd[at(d)] <= x {
                    return Some(Partition {
                        xmid: x,
                        ymid: y,
                        lo_minimal: true,
                        hi_minimal: true,
                    });
                }
                d -= 2;
            }

            // Same for the reverse search.
            if bmin > dmin {
                bmin -= 1;
                bd[at(bmin - 1)] = isize::MAX;
            } else {
                bmin += 1;
            }
            if bmax < dmax {
                bmax += 1;
                bd[at(bmax + 1)] = isize::MAX;
            } else {
                bmax -= 1;
            }
            let mut d = bmax;
            while d >= bmin {
                let tlo = bd[at(d - 1)];
                let thi = bd[at(d + 1)];
                let x0 = if tlo < thi { tlo } else { thi - 1 };
                let mut x = x0;
                let mut y = x0 - d;
                while xoff < x && yoff < y && eq(x - 1, y - 1) {
                    x -= 1;
                    y -= 1;
                }
                if x0 - x > SNAKE_LIMIT {
                    big_snake = true;
                }
                bd[at(d)] = x;
                if !odd && fmin <= d && d <= fmax && x <= fd[at(d)] {
                    return Some(Partition {
                        xmid: x,
                        ymid: y,
                        lo_minimal: true,
                        hi_minimal: true,
                    });
                }
                d -= 2;
            }

            // Neither search met the other with `c` edits each, so this box
            // needs at least `2c` more.
            if (2 * c) as usize > budget {
                return None;
            }

            if find_minimal {
                c += 1;
                continue;
            }

            // Progress heuristic: accept a diagonal that has advanced much
            // further than its edit cost, provided it ends in a long snake.
            if c > 200 && big_snake && heuristic {
                let mut best = 0;
                let mut found = None;
                let mut d = fmax;
                while d >= fmin {
                    let dd = d - fmid;
                    let x = fd[at(d)];
                    let y = x - d;
                    let v = (x - xoff) * 2 - dd;
                    if v > 12 * (c + dd.abs())
                        && v > best
                        && xoff + SNAKE_LIMIT <= x
                        && x < xlim
                        && yoff + SNAKE_LIMIT <= y
                        && y < ylim
                    {
                        let mut k = 1;
                        while eq(x - k, y - k) {
                            if k == SNAKE_LIMIT {
                                best = v;
                                found = Some((x, y));
                                break;
                            }
                            k += 1;
                        }
                    }
                    d -= 2;
                }
                if let Some((xmid, ymid)) = found {
                    return Some(Partition {
                        xmid,
                        ymid,
                        lo_minimal: true,
                        hi_minimal: false,
                    });
                }

                let mut best = 0;
                let mut found = None;
                let mut d = bmax;
                while d >= bmin {
                    let dd = d - bmid;
                    let x = bd[at(d)];
                    let y = x - d;
                    let v = (xlim - x) * 2 + dd;
                    if v > 12 * (c + dd.abs())
                        && v > best
                        && xoff < x
                        && x <= xlim - SNAKE_LIMIT
                        && yoff < y
                        && y <= ylim - SNAKE_LIMIT
                    {
                        let mut k = 0;
                        while eq(x + k, y + k) {
                            if k == SNAKE_LIMIT - 1 {
                                best = v;
                                found = Some((x, y));
                                break;
                            }
                            k += 1;
                        }
                    }
                    d -= 2;
                }
                if let Some((xmid, ymid)) = found {
                    return Some(Partition {
                        xmid,
                        ymid,
                        lo_minimal: false,
                        hi_minimal: true,
                    });
                }
            }

            // Too expensive: split at the furthest point either search reached.
            if c >= too_expensive {
                let mut fxybest = -1;
                let mut fxbest = 0;
                let mut d = fmax;
                while d >= fmin {
                    let mut x = fd[at(d)].min(xlim);
                    let mut y = x - d;
                    if ylim < y {
                        x = ylim + d;
                        y = ylim;
                    }
                    if fxybest < x + y {
                        fxybest = x + y;
                        fxbest = x;
                    }
                    d -= 2;
                }

                let mut bxybest = isize::MAX;
                let mut bxbest = 0;
                let mut d = bmax;
                while d >= bmin {
                    let mut x = bd[at(d)].max(xoff);
                    let mut y = x - d;
                    if y < yoff {
                        x = yoff + d;
                        y = yoff;
                    }
                    if x + y < bxybest {
                        bxybest = x + y;
                        bxbest = x;
                    }
                    d -= 2;
                }

                return Some(if (xlim + ylim) - bxybest < fxybest - (xoff + yoff) {
                    Partition {
                        xmid: fxbest,
                        ymid: fxybest - fxbest,
                        lo_minimal: true,
                        hi_minimal: false,
                    }
                } else {
                    Partition {
                        xmid: bxbest,
                        ymid: bxybest - bxbest,
                        lo_minimal: false,
                        hi_minimal: true,
                    }
                });
            }

            c += 1;
        }
    }
}

/// Turn delete/insert marks into an [`EditScript`].
///
/// Unmarked bytes are paired in order; a pair that does not match is
/// emitted as delete + insert so the script is exact whatever the marks.
fn build_script(a: &[u8], b: &[u8], deleted: &[bool], inserted: &[bool]) -> EditScript {
    let mut script = EditScript::new();
    let (mut i, mut j) = (0usize, 0usize);

    while i < a.len() || j < b.len() {
        if i < a.len() && deleted[i] {
            script.push(EditOp::Delete);
            i += 1;
        } else if j < b.len() && inserted[j] {
            script.push(EditOp::Insert(b[j]));
            j += 1;
        } else if i < a.len() && j < b.len() {
            let start = i;
            while i < a.len() && j < b.len() && !deleted[i] && !inserted[j] && a[i] == b[j] {
                i += 1;
                j += 1;
            }
            if i > start {
                script.push_copy(i - start);
            } else {
                script.push(EditOp::Delete);
                script.push(EditOp::Insert(b[j]));
                i += 1;
                j += 1;
            }
        } else if i < a.len() {
            script.push(EditOp::Delete);
            i += 1;
        } else {
            script.push(EditOp::Insert(b[j]));
            j += 1;
        }
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcg(seed: u64) -> impl FnMut() -> u64 {
        let mut state = seed;
        move || {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            state >> 33
        }
    }

    fn random_bytes(len: usize, alphabet: u8, seed: u64) -> Vec<u8> {
        let mut next = lcg(seed);
        (0..len)
            .map(|_| b'a'.wrapping_add((next() % alphabet as u64) as u8))
            .collect()
    }

    fn mutate(base: &[u8], edits: usize, seed: u64) -> Vec<u8> {
        let mut next = lcg(seed);
        let mut out = base.to_vec();
        for _ in 0..edits {
            let pos = if out.is_empty() { 0 } else { (next() as usize) % out.len() };
            match next() % 3 {
                0 if !out.is_empty() => {
                    out.remove(pos);
                }
                1 => out.insert(pos, (next() % 256) as u8),
                _ if !out.is_empty() => out[pos] = (next() % 256) as u8,
                _ => out.push(b'z'),
            }
        }
        out
    }

    /// Reference edit distance (insertions + deletions) via LCS.
    fn reference_distance(a: &[u8], b: &[u8]) -> usize {
        let mut prev = vec![0usize; b.len() + 1];
        for &x in a {
            let mut cur = vec![0usize; b.len() + 1];
            for (j, &y) in b.iter().enumerate() {
                cur[j + 1] = if x == y {
                    prev[j] + 1
                } else {
                    cur[j].max(prev[j + 1])
                };
            }
            prev = cur;
        }
        a.len() + b.len() - 2 * prev[b.len()]
    }

    #[test]
    fn test_identical_inputs_copy_everything() {
        let script = diff(b"AAAABBBB", b"AAAABBBB", DiffOptions::default()).unwrap();
        assert_eq!(script.ops(), &[EditOp::Copy(8)]);
        assert_eq!(script.edit_count(), 0);
    }

    #[test]
    fn test_single_byte_change() {
        let script = diff(b"AAAABBBB", b"AAAABBBX", DiffOptions::default()).unwrap();
        assert_eq!(script.apply(b"AAAABBBB").unwrap(), b"AAAABBBX");
        assert_eq!(script.edit_count(), 2);
    }

    #[test]
    fn test_empty_sides() {
        let grow = diff(b"", b"abc", DiffOptions::default()).unwrap();
        assert_eq!(grow.apply(b"").unwrap(), b"abc");
        assert_eq!(grow.edit_count(), 3);

        let shrink = diff(b"abc", b"", DiffOptions::default()).unwrap();
        assert_eq!(shrink.apply(b"abc").unwrap(), b"");
        assert_eq!(shrink.ops(), &[EditOp::Delete, EditOp::Delete, EditOp::Delete]);

        assert!(diff(b"", b"", DiffOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn test_classic_example_is_minimal() {
        let script = diff(b"ABCABBA", b"CBABAC", DiffOptions::minimal()).unwrap();
        assert_eq!(script.apply(b"ABCABBA").unwrap(), b"CBABAC");
        assert_eq!(script.edit_count(), 5);
    }

    #[test]
    fn test_minimal_matches_reference_distance() {
        for seed in 0..40 {
            let a = random_bytes(30 + (seed as usize % 20), 4, seed);
            let b = random_bytes(25 + (seed as usize % 17), 4, seed + 1000);
            let script = diff(&a, &b, DiffOptions::minimal()).unwrap();
            assert_eq!(script.apply(&a).unwrap(), b, "seed {seed}");
            assert_eq!(script.edit_count(), reference_distance(&a, &b), "seed {seed}");
        }
    }

    #[test]
    fn test_script_fidelity_on_mutations() {
        for seed in 0..30 {
            let a = random_bytes(2000, 16, seed);
            let b = mutate(&a, (seed as usize) * 5, seed + 7);
            let script = diff(&a, &b, DiffOptions::default()).unwrap();
            assert_eq!(script.apply(&a).unwrap(), b, "seed {seed}");
        }
    }

    #[test]
    fn test_fidelity_when_giving_up_early() {
        // A cost limit of 1 forces the too-expensive split on every box.
        let options = DiffOptions {
            too_expensive: Some(1),
            ..DiffOptions::default()
        };
        for seed in 0..20 {
            let a = random_bytes(800, 3, seed);
            let b = random_bytes(700, 3, seed + 50);
            let script = diff(&a, &b, options).unwrap();
            assert_eq!(script.apply(&a).unwrap(), b, "seed {seed}");
            assert!(script.edit_count() >= reference_distance(&a, &b));
        }
    }

    #[test]
    fn test_fidelity_with_long_snakes_and_heuristic() {
        // Long common runs separated by dense noise exercise the progress heuristic.
        let mut a = Vec::new();
        let mut b = Vec::new();
        for block in 0..40u64 {
            let common = random_bytes(60, 26, block);
            a.extend(random_bytes(15, 2, block + 500));
            b.extend(random_bytes(15, 2, block + 900));
            a.extend(&common);
            b.extend(&common);
        }
        let script = diff(&a, &b, DiffOptions::default()).unwrap();
        assert_eq!(script.apply(&a).unwrap(), b);
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let a = b"AAAABBBBCCCC";
        let b = b"AAAABBBBCCXX";
        let script = diff(a, b, DiffOptions::default().with_max_edits(4)).unwrap();
        assert_eq!(script.apply(a).unwrap(), b);
        assert_eq!(
            diff(a, b, DiffOptions::default().with_max_edits(3)),
            Err(DiffTooLarge { limit: 3 })
        );
    }

    #[test]
    fn test_ceiling_holds_for_minimal_search() {
        for seed in 0..20 {
            let a = random_bytes(40, 4, seed);
            let b = random_bytes(35, 4, seed + 300);
            let distance = reference_distance(&a, &b);
            let fits = DiffOptions::minimal().with_max_edits(distance);
            assert_eq!(diff(&a, &b, fits).unwrap().apply(&a).unwrap(), b, "seed {seed}");
            let short = DiffOptions::minimal().with_max_edits(distance - 1);
            assert!(diff(&a, &b, short).is_err(), "seed {seed}");
        }
    }

    #[test]
    fn test_unrelated_inputs_give_up_early() {
        let a = random_bytes(64 * 1024, 250, 11);
        let b = random_bytes(64 * 1024, 250, 12);
        assert_eq!(
            diff(&a, &b, DiffOptions::default().with_max_edits(64)),
            Err(DiffTooLarge { limit: 64 })
        );
    }

    #[test]
    fn test_ceiling_reports_too_large() {
        let a = random_bytes(500, 200, 1);
        let b = random_bytes(500, 200, 2);
        let result = diff(&a, &b, DiffOptions::default().with_max_edits(10));
        assert_eq!(result, Err(DiffTooLarge { limit: 10 }));

        let near = mutate(&a, 3, 3);
        assert!(diff(&a, &near, DiffOptions::default().with_max_edits(10)).is_ok());
    }
}
