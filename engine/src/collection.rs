//! Compile-time collection typing.
//!
//! A [`Collection`] binds a collection name to the Rust type of its
//! documents' bodies. A [`StoreSchema`] is the set of collections an
//! application declares; [`Declares<C>`] is implemented once per declared
//! collection so typed mutation calls only compile for those collections.
//!
//! ```rust
//! use docstash_engine::{store_schema, Collection, CollectionSchema, FieldDef, FieldType, StoreSchema};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! struct Users;
//!
//! impl Collection for Users {
//!     const NAME: &'static str = "users";
//!     type Doc = User;
//!
//!     fn schema() -> CollectionSchema {
//!         CollectionSchema::new(Self::NAME, vec![FieldDef::required("name", FieldType::String)])
//!     }
//! }
//!
//! store_schema! {
//!     pub struct AppSchema {
//!         version: 1,
//!         collections: [Users],
//!     }
//! }
//!
//! assert!(AppSchema::schema().declares("users"));
//! ```

use crate::{CollectionSchema, Schema};
use serde::{de::DeserializeOwned, Serialize};

/// A named collection with a typed document body.
pub trait Collection: 'static {
    /// Value stored in `_meta.collectionName`
    const NAME: &'static str;

    /// Application fields of the collection's documents
    type Doc: Serialize + DeserializeOwned;

    /// Runtime validation rules. Accepts any body unless overridden.
    fn schema() -> CollectionSchema {
        CollectionSchema::untyped(Self::NAME)
    }
}

/// The collections an application stores.
pub trait StoreSchema: Send + Sync + 'static {
    /// The runtime table used to check untyped mutations.
    fn schema() -> Schema;
}

/// Marks `C` as a collection declared by this schema.
pub trait Declares<C: Collection>: StoreSchema {}

/// Declare a [`StoreSchema`] and its [`Declares`] impls in one go.
#[macro_export]
macro_rules! store_schema {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            version: $version:expr,
            collections: [$($collection:ty),* $(,)?] $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default)]
        $vis struct $name;

        impl $crate::StoreSchema for $name {
            fn schema() -> $crate::Schema {
                $crate::Schema::new($version)
                    $(.with_collection(<$collection as $crate::Collection>::schema()))*
            }
        }

        $(impl $crate::Declares<$collection> for $name {})*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    struct Notes;

    impl Collection for Notes {
        const NAME: &'static str = "notes";
        type Doc = Note;

        fn schema() -> CollectionSchema {
            CollectionSchema::new(Self::NAME, vec![FieldDef::required("text", FieldType::String)])
        }
    }

    struct Tags;

    impl Collection for Tags {
        const NAME: &'static str = "tags";
        type Doc = serde_json::Map<String, serde_json::Value>;
    }

    store_schema! {
        struct TestSchema {
            version: 3,
            collections: [Notes, Tags],
        }
    }

    fn assert_declares<S: Declares<C>, C: Collection>() {}

    #[test]
    fn macro_builds_runtime_table() {
        let schema = TestSchema::schema();
        assert_eq!(schema.version, 3);
        assert_eq!(schema.collection_names(), vec!["notes", "tags"]);

        assert!(schema
            .validate_body("notes", &json!({"text": "hi"}))
            .is_ok());
        assert!(schema.validate_body("notes", &json!({})).is_err());
        assert!(schema.validate_body("tags", &json!({"any": 1})).is_ok());
    }

    #[test]
    fn macro_declares_each_collection() {
        assert_declares::<TestSchema, Notes>();
        assert_declares::<TestSchema, Tags>();
    }
}
