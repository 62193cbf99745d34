use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Discrete steering input, shared by remote players and policies.
/// Travels as a bare number (0, 1 or 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Action {
    /// Turn by `-turn_rate * dt`
    TurnNegative,
    /// Turn by `+turn_rate * dt`
    TurnPositive,
    #[default]
    Straight,
}

impl Action {
    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Action::TurnNegative),
            1 => Some(Action::TurnPositive),
            2 => Some(Action::Straight),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        match self {
            Action::TurnNegative => 0,
            Action::TurnPositive => 1,
            Action::Straight => 2,
        }
    }

    /// Heading change direction: -1, +1 or 0.
    pub fn steer_sign(self) -> f32 {
        match self {
            Action::TurnNegative => -1.0,
            Action::TurnPositive => 1.0,
            Action::Straight => 0.0,
        }
    }

    pub fn is_steering(self) -> bool {
        self != Action::Straight
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> Self {
        action.index()
    }
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Action::from_index(value as usize).ok_or_else(|| format!("unknown action {}", value))
    }
}

/// Visual identity picked by a player. Packed into the high nibble of the
/// frame's flag byte, so discriminants must stay within 1..=15 (0 = none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Skin {
    Blue = 1,
    Red = 2,
    Green = 3,
    Yellow = 4,
    Purple = 5,
    Orange = 6,
}

impl Skin {
    pub const ALL: [Skin; 6] = [
        Skin::Blue,
        Skin::Red,
        Skin::Green,
        Skin::Yellow,
        Skin::Purple,
        Skin::Orange,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "blue" => Some(Skin::Blue),
            "red" => Some(Skin::Red),
            "green" => Some(Skin::Green),
            "yellow" => Some(Skin::Yellow),
            "purple" => Some(Skin::Purple),
            "orange" => Some(Skin::Orange),
            _ => None,
        }
    }

    pub fn from_nibble(value: u8) -> Option<Self> {
        Skin::ALL.iter().copied().find(|s| *s as u8 == value)
    }
}

/// What a connection is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../web/src/generated/")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Player,
    Spectator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_indices_are_stable() {
        for i in 0..3 {
            let action = Action::from_index(i).unwrap();
            assert_eq!(action.index() as usize, i);
        }
        assert!(Action::from_index(3).is_none());
    }

    #[test]
    fn action_serializes_as_number() {
        let json = serde_json::to_string(&Action::TurnPositive).unwrap();
        assert_eq!(json, "1");
        let parsed: Action = serde_json::from_str("0").unwrap();
        assert_eq!(parsed, Action::TurnNegative);
        assert!(serde_json::from_str::<Action>("7").is_err());
    }

    #[test]
    fn skin_names_parse_case_insensitively() {
        assert_eq!(Skin::from_name("Red"), Some(Skin::Red));
        assert_eq!(Skin::from_name(" purple "), Some(Skin::Purple));
        assert_eq!(Skin::from_name(""), None);
        assert_eq!(Skin::from_name("chartreuse"), None);
    }

    #[test]
    fn skins_fit_in_a_nibble() {
        for skin in Skin::ALL {
            let v = skin as u8;
            assert!((1..=15).contains(&v));
            assert_eq!(Skin::from_nibble(v), Some(skin));
        }
    }
}
