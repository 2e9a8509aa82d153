//! Racing window and dial-set construction

use rand::seq::SliceRandom;
use rand::Rng;

use super::quality::{Classified, Endpoint};

/// Which dial-set policy to apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Plain TCP: good, unknown and bad in equal shares, topped up to `3w`
    Tcp,
    /// TLS: lean on the good set when it is healthy
    Tls,
}

/// Tracker totals used to size the window
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowInputs {
    /// Good endpoints in this tracker
    pub good: usize,
    /// Bad endpoints in this tracker
    pub bad: usize,
    /// `(good, bad)` of the peer tracker (TLS history for the TCP racer)
    pub peer: Option<(usize, usize)>,
}

/// Window size for retry round `round`
///
/// Healthy peer history shrinks the window by 2 (floor 2); a tracker
/// dominated by failures grows it by 2.
#[must_use]
pub fn window_size(base: usize, round: usize, inputs: WindowInputs) -> usize {
    let mut window = base + round;
    if let Some((peer_good, peer_bad)) = inputs.peer {
        if peer_good > peer_bad {
            window = window.saturating_sub(2).max(2);
        }
    }
    if inputs.bad / 2 >= inputs.good && inputs.good * 2 <= window * 3 {
        window += 2;
    }
    window
}

/// Build the set of endpoints to dial this round
///
/// The result never repeats an endpoint and never exceeds `addresses`.
pub fn dial_set<R: Rng + ?Sized>(
    policy: SelectionPolicy,
    window: usize,
    classified: &Classified,
    addresses: &[Endpoint],
    rng: &mut R,
) -> Vec<Endpoint> {
    let mut unknown = classified.unknown.clone();
    unknown.shuffle(rng);

    let good = classified.good.len();
    let bad = classified.bad.len();

    match policy {
        SelectionPolicy::Tls if bad * 5 < good && good > 10 => {
            let mut set: Vec<Endpoint> = classified.good.iter().take(window).copied().collect();
            set.extend(unknown.first().copied());
            set
        }
        SelectionPolicy::Tls if good > 2 * window || bad * 2 < good => classified
            .good
            .iter()
            .take(window)
            .chain(unknown.iter())
            .chain(classified.bad.iter())
            .take(2 * window)
            .copied()
            .collect(),
        SelectionPolicy::Tcp | SelectionPolicy::Tls => {
            let mut set: Vec<Endpoint> = classified
                .good
                .iter()
                .take(window)
                .chain(unknown.iter().take(window))
                .chain(classified.bad.iter().take(window))
                .copied()
                .collect();
            top_up(&mut set, 3 * window, addresses, rng);
            set
        }
    }
}

fn top_up<R: Rng + ?Sized>(set: &mut Vec<Endpoint>, target: usize, addresses: &[Endpoint], rng: &mut R) {
    let missing = target.saturating_sub(set.len());
    if missing == 0 || missing > addresses.len() {
        return;
    }
    let mut rest: Vec<Endpoint> = addresses.iter().filter(|ep| !set.contains(ep)).copied().collect();
    rest.shuffle(rng);
    set.extend(rest.into_iter().take(missing));
}
