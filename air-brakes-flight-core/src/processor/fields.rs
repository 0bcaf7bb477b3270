use core::fmt;

use serde::{Serialize, Serializer};

/// Fields of a processed tick that can be marked invalid.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SampleField {
    Timestamp = 0,
    Altitude = 1,
    VerticalVelocity = 2,
    VerticalAcceleration = 3,
    Orientation = 4,
    CompensatedAcceleration = 5,
    RawAcceleration = 6,
}

impl SampleField {
    pub const ALL: [SampleField; 7] = [
        Self::Timestamp,
        Self::Altitude,
        Self::VerticalVelocity,
        Self::VerticalAcceleration,
        Self::Orientation,
        Self::CompensatedAcceleration,
        Self::RawAcceleration,
    ];

    /// the three fields every processed sample carries
    pub const DERIVED: [SampleField; 3] = [
        Self::Altitude,
        Self::VerticalVelocity,
        Self::VerticalAcceleration,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Timestamp => "timestamp",
            Self::Altitude => "altitude",
            Self::VerticalVelocity => "vertical_velocity",
            Self::VerticalAcceleration => "vertical_acceleration",
            Self::Orientation => "orientation",
            Self::CompensatedAcceleration => "compensated_acceleration",
            Self::RawAcceleration => "raw_acceleration",
        }
    }

    fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

/// Set of [`SampleField`]s that were missing, non-finite, out of range or
/// timestamp-inconsistent in a tick.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidFields(u16);

impl InvalidFields {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all_derived() -> Self {
        let mut set = Self::empty();
        for field in SampleField::DERIVED {
            set.insert(field);
        }
        set
    }

    pub fn insert(&mut self, field: SampleField) {
        self.0 |= field.bit();
    }

    pub fn contains(&self, field: SampleField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = SampleField> + '_ {
        SampleField::ALL
            .into_iter()
            .filter(move |field| self.contains(*field))
    }
}

impl fmt::Debug for InvalidFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(SampleField::name)).finish()
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for InvalidFields {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "InvalidFields({=u16:b})", self.0);
    }
}

/// Serialized as the field names joined by `|`, empty when everything is valid.
impl Serialize for InvalidFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut joined = heapless::String::<160>::new();
        for (i, field) in self.iter().enumerate() {
            if i > 0 {
                joined.push('|').ok();
            }
            joined.push_str(field.name()).ok();
        }
        serializer.serialize_str(&joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_iterate_in_declaration_order() {
        let mut set = InvalidFields::empty();
        assert!(set.is_empty());

        set.insert(SampleField::VerticalAcceleration);
        set.insert(SampleField::Altitude);
        set.insert(SampleField::Altitude);

        assert_eq!(set.len(), 2);
        assert!(set.contains(SampleField::Altitude));
        assert!(!set.contains(SampleField::Timestamp));

        let names: Vec<_> = set.iter().map(SampleField::name).collect();
        assert_eq!(names, vec!["altitude", "vertical_acceleration"]);
    }

    #[test]
    fn all_derived_covers_processed_fields() {
        let set = InvalidFields::all_derived();
        for field in SampleField::DERIVED {
            assert!(set.contains(field));
        }
        assert!(!set.contains(SampleField::Orientation));
    }
}
