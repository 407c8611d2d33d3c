//! Smart bus cycling for source controls.
//!
//! The selection is local to one control: which of a source's mixes the
//! dial and mute button act on. It is derived only from the current
//! selection and the daemon's confirmed link state, never from a press
//! counter.
//!
//! Unlinked cycle: `None → A → Both → B → A → …`. A linked source moves
//! both mixes together, so its selection is always `Both`.

use serde::{Deserialize, Serialize};
use weaverproto::Mix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BusSelection {
    #[default]
    None,
    A,
    B,
    Both,
}

impl BusSelection {
    pub fn from_mixes(mixes: &[Mix]) -> Self {
        match (mixes.contains(&Mix::A), mixes.contains(&Mix::B)) {
            (true, true) => BusSelection::Both,
            (true, false) => BusSelection::A,
            (false, true) => BusSelection::B,
            (false, false) => BusSelection::None,
        }
    }

    /// Parse config strings like `["A", "B"]`; unknown entries are skipped.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mixes: Vec<Mix> = names
            .iter()
            .filter_map(|n| n.as_ref().parse().ok())
            .collect();
        Self::from_mixes(&mixes)
    }

    pub fn mixes(self) -> Vec<Mix> {
        match self {
            BusSelection::None => vec![],
            BusSelection::A => vec![Mix::A],
            BusSelection::B => vec![Mix::B],
            BusSelection::Both => vec![Mix::A, Mix::B],
        }
    }

    pub fn contains(self, mix: Mix) -> bool {
        self.mixes().contains(&mix)
    }

    pub fn is_empty(self) -> bool {
        self == BusSelection::None
    }

    /// The mix whose value a control displays: B whenever B is selected.
    pub fn display_mix(self) -> Mix {
        if self.contains(Mix::B) {
            Mix::B
        } else {
            Mix::A
        }
    }
}

/// A user action on the bus selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPress {
    /// Long press: step through the cycle.
    Cycle,
    /// Touch menu: add or remove one mix.
    Toggle(Mix),
}

/// Next selection for a cycle press.
pub fn next_bus(current: BusSelection, linked: bool) -> BusSelection {
    if linked {
        return BusSelection::Both;
    }
    match current {
        BusSelection::None => BusSelection::A,
        BusSelection::A => BusSelection::Both,
        BusSelection::Both => BusSelection::B,
        BusSelection::B => BusSelection::A,
    }
}

/// Apply any press. Never returns an empty selection.
pub fn apply_press(current: BusSelection, linked: bool, press: BusPress) -> BusSelection {
    match press {
        BusPress::Cycle => next_bus(current, linked),
        BusPress::Toggle(_) if linked => BusSelection::Both,
        BusPress::Toggle(mix) => {
            let mut mixes = current.mixes();
            if let Some(pos) = mixes.iter().position(|m| *m == mix) {
                mixes.remove(pos);
            } else {
                mixes.push(mix);
            }
            if mixes.is_empty() {
                // Removing the last mix hands the selection to the other one
                mixes.push(mix.other());
            }
            BusSelection::from_mixes(&mixes)
        }
    }
}
