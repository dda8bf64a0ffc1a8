//! Identifiers for users, devices, rooms and events.
//!
//! All of these are completely opaque character sequences as far as this
//! library is concerned; the newtypes exist for their semantic value. Each
//! identifier comes as a borrowed slice type (`UserId`) and an owned
//! counterpart (`OwnedUserId`, a `Box<UserId>`).

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};

/// Generates a random opaque identifier of the given length.
fn generate_opaque_id(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

macro_rules! opaque_identifier {
    (
        $(#[doc = $docs:literal])*
        $id:ident, $owned:ident;
    ) => {
        $(#[doc = $docs])*
        #[repr(transparent)]
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $id(str);

        $(#[doc = $docs])*
        #[doc = ""]
        #[doc = concat!("Owned variant of [`", stringify!($id), "`].")]
        pub type $owned = Box<$id>;

        impl $id {
            fn from_borrowed(s: &str) -> &Self {
                // SAFETY: repr(transparent) newtype around `str`.
                unsafe { &*(s as *const str as *const Self) }
            }

            fn from_box(s: Box<str>) -> Box<Self> {
                // SAFETY: repr(transparent) newtype around `str`.
                unsafe { Box::from_raw(Box::into_raw(s) as *mut Self) }
            }

            fn into_box(self: Box<Self>) -> Box<str> {
                // SAFETY: repr(transparent) newtype around `str`.
                unsafe { Box::from_raw(Box::into_raw(self) as *mut str) }
            }

            /// Access the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Clone for Box<$id> {
            fn clone(&self) -> Self {
                (**self).to_owned()
            }
        }

        impl ToOwned for $id {
            type Owned = Box<$id>;

            fn to_owned(&self) -> Self::Owned {
                Self::from_box(self.0.into())
            }
        }

        impl AsRef<str> for $id {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl AsRef<str> for Box<$id> {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl<'a> From<&'a str> for &'a $id {
            fn from(s: &'a str) -> Self {
                $id::from_borrowed(s)
            }
        }

        impl From<&str> for Box<$id> {
            fn from(s: &str) -> Self {
                $id::from_box(s.into())
            }
        }

        impl From<String> for Box<$id> {
            fn from(s: String) -> Self {
                $id::from_box(s.into())
            }
        }

        impl From<Box<$id>> for String {
            fn from(id: Box<$id>) -> Self {
                id.into_box().into()
            }
        }

        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl fmt::Debug for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                <str as fmt::Debug>::fmt(self.as_str(), f)
            }
        }

        impl PartialEq<str> for $id {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $id {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl PartialEq<&str> for Box<$id> {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl PartialEq<$id> for Box<$id> {
            fn eq(&self, other: &$id) -> bool {
                self.as_str() == other.as_str()
            }
        }

        impl serde::Serialize for $id {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for Box<$id> {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                Ok(<String as serde::Deserialize>::deserialize(deserializer)?.into())
            }
        }
    };
}

opaque_identifier! {
    /// A Matrix user ID.
    UserId, OwnedUserId;
}

opaque_identifier! {
    /// A Matrix device ID.
    ///
    /// Device identifiers in Matrix are completely opaque character
    /// sequences. This type is provided simply for its semantic value.
    DeviceId, OwnedDeviceId;
}

opaque_identifier! {
    /// A Matrix room ID.
    RoomId, OwnedRoomId;
}

opaque_identifier! {
    /// A Matrix event ID.
    EventId, OwnedEventId;
}

opaque_identifier! {
    /// A Matrix transaction ID.
    ///
    /// Transaction IDs in Matrix are opaque strings. This type is provided
    /// simply for its semantic value.
    TransactionId, OwnedTransactionId;
}

impl DeviceId {
    /// Generates a random `DeviceId`, suitable for assignment to a new
    /// device.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> OwnedDeviceId {
        generate_opaque_id(10).into()
    }
}

impl TransactionId {
    /// Generates a random `TransactionId`, suitable for a new request.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> OwnedTransactionId {
        generate_opaque_id(16).into()
    }
}

#[cfg(test)]
mod tests {
    use super::{DeviceId, OwnedDeviceId, OwnedUserId, TransactionId, UserId};

    #[test]
    fn generate_device_id() {
        assert_eq!(DeviceId::new().as_str().len(), 10);
    }

    #[test]
    fn generate_transaction_id() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn create_device_id_from_str() {
        let ref_id: &DeviceId = "abcdefgh".into();
        assert_eq!(ref_id.as_str(), "abcdefgh");

        let owned_id: OwnedDeviceId = "ijklmnop".into();
        assert_eq!(owned_id.as_str(), "ijklmnop");
    }

    #[test]
    fn user_id_round_trips_through_serde() {
        let user: OwnedUserId = "@alice:example.org".into();
        let json = serde_json::to_value(&*user).unwrap();
        assert_eq!(json, serde_json::json!("@alice:example.org"));

        let back: OwnedUserId = serde_json::from_value(json).unwrap();
        assert_eq!(back, user);
    }

    #[test]
    fn borrowed_to_owned() {
        let borrowed: &UserId = "@bob:example.org".into();
        let owned = borrowed.to_owned();
        assert_eq!(owned.as_str(), "@bob:example.org");
    }
}
