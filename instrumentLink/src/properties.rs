//! Named, typed properties of a handle.
//!
//! Every handle type carries a static table of [`Property`] entries. Each entry pairs a name with
//! a typed getter and, for writable properties, a setter. Scripting front ends can then list,
//! read, and write properties by name without a hand-written dispatch per handle.

use crate::{DeviceError, Timeout};

/// Whether a property can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The property can only be read. Computed properties are always read-only.
    ReadOnly,
    /// The property can be read and written.
    ReadWrite,
}

/// The value of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A flag.
    Bool(bool),
    /// An integer, e.g., a port number or a byte count.
    Int(i64),
    /// A floating point number, e.g., the number of stop bits.
    Float(f64),
    /// Text, e.g., an address or a terminator.
    Text(String),
    /// A timeout.
    Timeout(Timeout),
}

impl PropertyValue {
    /// Name of the value's type, as used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Int(_) => "int",
            PropertyValue::Float(_) => "float",
            PropertyValue::Text(_) => "text",
            PropertyValue::Timeout(_) => "timeout",
        }
    }

    /// Interpret the value as a flag.
    pub fn into_bool(self, name: &'static str) -> Result<bool, DeviceError> {
        match self {
            PropertyValue::Bool(b) => Ok(b),
            PropertyValue::Int(i) => Ok(i != 0),
            _ => Err(DeviceError::PropertyType {
                name,
                expected: "bool",
            }),
        }
    }

    /// Interpret the value as an integer.
    pub fn into_int(self, name: &'static str) -> Result<i64, DeviceError> {
        match self {
            PropertyValue::Int(i) => Ok(i),
            PropertyValue::Float(f) if f.fract() == 0.0 => Ok(f as i64),
            _ => Err(DeviceError::PropertyType {
                name,
                expected: "int",
            }),
        }
    }

    /// Interpret the value as a floating point number.
    pub fn into_float(self, name: &'static str) -> Result<f64, DeviceError> {
        match self {
            PropertyValue::Float(f) => Ok(f),
            PropertyValue::Int(i) => Ok(i as f64),
            _ => Err(DeviceError::PropertyType {
                name,
                expected: "float",
            }),
        }
    }

    /// Interpret the value as text.
    pub fn into_text(self, name: &'static str) -> Result<String, DeviceError> {
        match self {
            PropertyValue::Text(s) => Ok(s),
            _ => Err(DeviceError::PropertyType {
                name,
                expected: "text",
            }),
        }
    }

    /// Interpret the value as a timeout. Numbers are taken as seconds.
    pub fn into_timeout(self, name: &'static str) -> Result<Timeout, DeviceError> {
        match self {
            PropertyValue::Timeout(t) => Ok(t),
            PropertyValue::Float(f) => Timeout::from_secs_f64(f),
            PropertyValue::Int(i) => Timeout::from_secs_f64(i as f64),
            _ => Err(DeviceError::PropertyType {
                name,
                expected: "timeout",
            }),
        }
    }
}

/// One entry of a handle's property table.
pub struct Property<T> {
    /// The property name, e.g., `"Timeout"`. Lookups ignore case.
    pub name: &'static str,
    /// Read the current value.
    pub getter: fn(&T) -> PropertyValue,
    /// Write a new value. `None` for read-only properties.
    pub setter: Option<fn(&mut T, PropertyValue) -> Result<(), DeviceError>>,
}

impl<T> Property<T> {
    /// Whether the property can be written.
    pub fn access(&self) -> Access {
        if self.setter.is_some() {
            Access::ReadWrite
        } else {
            Access::ReadOnly
        }
    }
}

impl<T> std::fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("access", &self.access())
            .finish()
    }
}

/// Handles with a static table of named properties.
pub trait Properties: Sized + 'static {
    /// The property table of this handle type.
    const PROPERTIES: &'static [Property<Self>];

    /// Names of all properties, in table order.
    fn property_names() -> Vec<&'static str> {
        Self::PROPERTIES.iter().map(|p| p.name).collect()
    }

    /// Look a property up by name, ignoring case.
    fn find_property(name: &str) -> Result<&'static Property<Self>, DeviceError> {
        Self::PROPERTIES
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DeviceError::UnknownProperty(name.to_string()))
    }

    /// Read a property by name.
    fn get_property(&self, name: &str) -> Result<PropertyValue, DeviceError> {
        let property = Self::find_property(name)?;
        Ok((property.getter)(self))
    }

    /// Write a property by name.
    fn set_property(&mut self, name: &str, value: PropertyValue) -> Result<(), DeviceError> {
        let property = Self::find_property(name)?;
        let setter = property
            .setter
            .ok_or_else(|| DeviceError::ReadOnlyProperty(property.name.to_string()))?;
        setter(self, value)
    }
}

/// Convert a byte count to a property integer.
pub(crate) fn count_value(count: usize) -> PropertyValue {
    PropertyValue::Int(i64::try_from(count).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        level: i64,
    }

    impl Properties for Dummy {
        const PROPERTIES: &'static [Property<Self>] = &[
            Property {
                name: "Level",
                getter: |d| PropertyValue::Int(d.level),
                setter: Some(|d, v| {
                    d.level = v.into_int("Level")?;
                    Ok(())
                }),
            },
            Property {
                name: "Kind",
                getter: |_| PropertyValue::Text("dummy".to_string()),
                setter: None,
            },
        ];
    }

    #[test]
    fn test_lookup_ignores_case() {
        let mut d = Dummy { level: 1 };
        assert_eq!(d.get_property("level").unwrap(), PropertyValue::Int(1));
        d.set_property("LEVEL", PropertyValue::Float(4.0)).unwrap();
        assert_eq!(d.level, 4);
        assert_eq!(Dummy::property_names(), vec!["Level", "Kind"]);
    }

    #[test]
    fn test_errors() {
        let mut d = Dummy { level: 1 };
        assert!(matches!(
            d.set_property("Kind", PropertyValue::Text("x".into())),
            Err(DeviceError::ReadOnlyProperty(_))
        ));
        assert!(matches!(
            d.get_property("Missing"),
            Err(DeviceError::UnknownProperty(_))
        ));
        assert!(matches!(
            d.set_property("Level", PropertyValue::Text("x".into())),
            Err(DeviceError::PropertyType { name: "Level", .. })
        ));
        assert_eq!(Dummy::find_property("kind").unwrap().access(), Access::ReadOnly);
    }
}
