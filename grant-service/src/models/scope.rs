use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;

const ALL_KEYWORD: &str = "all";

/// A rule or ruler field: either every value, or an explicit set.
///
/// Stored as the string `"all"` or as an array of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope<T: Ord> {
    All,
    Only(BTreeSet<T>),
}

impl<T: Ord> Scope<T> {
    pub fn only<I: IntoIterator<Item = T>>(values: I) -> Self {
        Scope::Only(values.into_iter().collect())
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Scope::All)
    }

    /// `All` matches everything; an explicit set matches when any entry satisfies `pred`.
    pub fn matches_any<F>(&self, pred: F) -> bool
    where
        F: Fn(&T) -> bool,
    {
        match self {
            Scope::All => true,
            Scope::Only(values) => values.iter().any(pred),
        }
    }

    /// True for an explicit set with no entries.
    pub fn is_empty_set(&self) -> bool {
        matches!(self, Scope::Only(values) if values.is_empty())
    }
}

impl<T: Ord + Serialize> Serialize for Scope<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Scope::All => serializer.serialize_str(ALL_KEYWORD),
            Scope::Only(values) => values.serialize(serializer),
        }
    }
}

impl<'de, T> Deserialize<'de> for Scope<T>
where
    T: Ord + Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<U: Ord> {
            Keyword(String),
            Set(BTreeSet<U>),
        }

        match Repr::<T>::deserialize(deserializer)? {
            Repr::Keyword(word) if word == ALL_KEYWORD => Ok(Scope::All),
            Repr::Keyword(word) => Err(de::Error::custom(format!(
                "expected \"{ALL_KEYWORD}\" or a list, found \"{word}\""
            ))),
            Repr::Set(values) => Ok(Scope::Only(values)),
        }
    }
}
