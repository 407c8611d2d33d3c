//! Commands the daemon accepts under the `Pipewire` request.
//!
//! Every command carries absolute values, so sending one twice leaves the
//! daemon in the same state as sending it once.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of a source's two independent mixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mix {
    A,
    B,
}

impl Mix {
    pub const ALL: [Mix; 2] = [Mix::A, Mix::B];

    pub fn other(self) -> Mix {
        match self {
            Mix::A => Mix::B,
            Mix::B => Mix::A,
        }
    }

    /// The mute target that silences this mix.
    pub fn mute_target(self) -> MuteTarget {
        match self {
            Mix::A => MuteTarget::TargetA,
            Mix::B => MuteTarget::TargetB,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mix::A => "A",
            Mix::B => "B",
        }
    }
}

impl fmt::Display for Mix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Mix::A),
            "B" | "b" => Ok(Mix::B),
            other => Err(format!("unknown mix {other:?}, expected A or B")),
        }
    }
}

/// A source's mute channel. Muting a source on `TargetA` silences mix A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MuteTarget {
    TargetA,
    TargetB,
}

impl MuteTarget {
    pub fn mix(self) -> Mix {
        match self {
            MuteTarget::TargetA => Mix::A,
            MuteTarget::TargetB => Mix::B,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MuteTarget::TargetA => "TargetA",
            MuteTarget::TargetB => "TargetB",
        }
    }
}

/// Mute state of a target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuteState {
    Muted,
    Unmuted,
}

impl MuteState {
    pub fn from_muted(muted: bool) -> Self {
        if muted {
            MuteState::Muted
        } else {
            MuteState::Unmuted
        }
    }

    pub fn is_muted(self) -> bool {
        matches!(self, MuteState::Muted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MuteState::Muted => "Muted",
            MuteState::Unmuted => "Unmuted",
        }
    }
}

/// Device mutation commands.
///
/// Serialized externally tagged with positional arguments, e.g.
/// `{"SetSourceVolume": ["<id>", "A", 70]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonCommand {
    SetSourceVolume(String, Mix, u8),
    SetSourceVolumeLinked(String, bool),
    SetTargetVolume(String, u8),
    SetTargetMuteState(String, MuteState),
    AddSourceMuteTarget(String, MuteTarget),
    DelSourceMuteTarget(String, MuteTarget),
    /// Route a source's mute channel to one more target.
    AddMuteTargetNode(String, MuteTarget, String),
    DelMuteTargetNode(String, MuteTarget, String),
}

impl DaemonCommand {
    /// Device the command addresses.
    pub fn device_id(&self) -> &str {
        match self {
            DaemonCommand::SetSourceVolume(id, ..)
            | DaemonCommand::SetSourceVolumeLinked(id, ..)
            | DaemonCommand::SetTargetVolume(id, ..)
            | DaemonCommand::SetTargetMuteState(id, ..)
            | DaemonCommand::AddSourceMuteTarget(id, ..)
            | DaemonCommand::DelSourceMuteTarget(id, ..)
            | DaemonCommand::AddMuteTargetNode(id, ..)
            | DaemonCommand::DelMuteTargetNode(id, ..) => id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DaemonCommand::SetSourceVolume(..) => "SetSourceVolume",
            DaemonCommand::SetSourceVolumeLinked(..) => "SetSourceVolumeLinked",
            DaemonCommand::SetTargetVolume(..) => "SetTargetVolume",
            DaemonCommand::SetTargetMuteState(..) => "SetTargetMuteState",
            DaemonCommand::AddSourceMuteTarget(..) => "AddSourceMuteTarget",
            DaemonCommand::DelSourceMuteTarget(..) => "DelSourceMuteTarget",
            DaemonCommand::AddMuteTargetNode(..) => "AddMuteTargetNode",
            DaemonCommand::DelMuteTargetNode(..) => "DelMuteTargetNode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_positionally() {
        let cmd = DaemonCommand::SetSourceVolume("src1".into(), Mix::A, 70);
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"SetSourceVolume": ["src1", "A", 70]})
        );

        let cmd = DaemonCommand::SetTargetMuteState("tgt".into(), MuteState::Muted);
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"SetTargetMuteState": ["tgt", "Muted"]})
        );

        let cmd = DaemonCommand::AddMuteTargetNode("src1".into(), MuteTarget::TargetB, "hp".into());
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"AddMuteTargetNode": ["src1", "TargetB", "hp"]})
        );
    }

    #[test]
    fn mix_helpers() {
        assert_eq!(Mix::A.other(), Mix::B);
        assert_eq!(Mix::B.mute_target(), MuteTarget::TargetB);
        assert_eq!(MuteTarget::TargetA.mix(), Mix::A);
        assert_eq!("b".parse::<Mix>().unwrap(), Mix::B);
        assert!("C".parse::<Mix>().is_err());
    }

    #[test]
    fn device_id_and_name() {
        let cmd = DaemonCommand::SetSourceVolumeLinked("src9".into(), true);
        assert_eq!(cmd.device_id(), "src9");
        assert_eq!(cmd.name(), "SetSourceVolumeLinked");
    }
}
