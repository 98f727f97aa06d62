use std::fmt;

/// Per-bin scaling vector applied to raw counts.
///
/// The well-known methods get variants; anything else round-trips through
/// `Other` so externally computed vectors keep their labels.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Normalization {
    None,
    Vc,
    VcSqrt,
    Kr,
    Scale,
    Other(String),
}
impl Normalization {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "NONE" => Self::None,
            "VC" => Self::Vc,
            "VC_SQRT" => Self::VcSqrt,
            "KR" => Self::Kr,
            "SCALE" => Self::Scale,
            other => Self::Other(other.to_string()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::None => "NONE",
            Self::Vc => "VC",
            Self::VcSqrt => "VC_SQRT",
            Self::Kr => "KR",
            Self::Scale => "SCALE",
            Self::Other(name) => name,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}
impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Which matrix a selector materializes from raw counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatrixType {
    /// Raw (optionally normalized) counts
    Observed,
    /// The expected value at each observed pixel's position
    Expected,
    /// Observed divided by expected
    ObservedExpected,
}
impl fmt::Display for MatrixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Observed => "observed",
            Self::Expected => "expected",
            Self::ObservedExpected => "oe",
        };
        write!(f, "{name}")
    }
}

/// Bin-axis unit of a stored matrix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Unit {
    /// Fixed-width base-pair bins
    Bp,
    /// Restriction-fragment bins
    Frag,
}
impl Unit {
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            Self::Bp => 0,
            Self::Frag => 1,
        }
    }

    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Bp),
            1 => Some(Self::Frag),
            _ => None,
        }
    }
}
impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bp => "BP",
            Self::Frag => "FRAG",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_name_round_trip() {
        for name in ["NONE", "VC", "VC_SQRT", "KR", "SCALE", "GW_KR"] {
            assert_eq!(Normalization::from_name(name).name(), name);
        }
        assert!(Normalization::from_name("NONE").is_none());
        assert!(!Normalization::from_name("KR").is_none());
    }

    #[test]
    fn test_unit_tag_round_trip() {
        assert_eq!(Unit::from_tag(Unit::Bp.tag()), Some(Unit::Bp));
        assert_eq!(Unit::from_tag(Unit::Frag.tag()), Some(Unit::Frag));
        assert_eq!(Unit::from_tag(7), None);
    }
}
