use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::cleanup::CleanupTarget;
use crate::core::selection::Selectable;
use crate::core::store::{DeleteError, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContactId(String);

impl ContactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub display_name: String,
    pub phone_numbers: Vec<String>,
    pub emails: Vec<String>,
}

/// Address book the contacts cleanup reads from and deletes in.
pub trait ContactsStore: Sync {
    fn list_contacts(&self) -> Result<Vec<Contact>, StoreError>;

    fn delete(&self, id: &ContactId) -> Result<(), DeleteError>;

    /// How complete a record is, from 0.0 (nothing useful) to 1.0.
    fn completeness_score(&self, contact: &Contact) -> f32 {
        let filled = |values: &[String]| values.iter().any(|v| !v.trim().is_empty());

        let mut score = 0.0;
        if !contact.display_name.trim().is_empty() {
            score += 0.4;
        }
        if filled(&contact.phone_numbers) {
            score += 0.4;
        }
        if filled(&contact.emails) {
            score += 0.2;
        }
        score
    }
}

/// A contact offered for deletion together with its completeness score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactCandidate {
    pub contact: Contact,
    pub score: f32,
}

impl Selectable for ContactCandidate {
    type Id = ContactId;

    fn id(&self) -> ContactId {
        self.contact.id.clone()
    }

    fn is_protected(&self) -> bool {
        false
    }

    fn byte_size(&self) -> u64 {
        0
    }
}

/// Contacts scoring at or below `max_score`, least complete first.
pub fn incomplete_contacts<S: ContactsStore + ?Sized>(
    store: &S,
    max_score: f32,
) -> Result<Vec<ContactCandidate>, StoreError> {
    let mut candidates: Vec<ContactCandidate> = store
        .list_contacts()?
        .into_iter()
        .map(|contact| ContactCandidate {
            score: store.completeness_score(&contact),
            contact,
        })
        .filter(|candidate| candidate.score <= max_score)
        .collect();

    candidates.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.contact.id.cmp(&b.contact.id))
    });
    log::debug!(
        "{} contacts score at or below {:.2}",
        candidates.len(),
        max_score
    );
    Ok(candidates)
}

/// Lets the cleanup executor delete contacts.
pub struct ContactsCleanup<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S: ContactsStore + ?Sized> ContactsCleanup<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }
}

impl<S: ContactsStore + ?Sized> CleanupTarget for ContactsCleanup<'_, S> {
    type Id = ContactId;

    fn delete(&self, id: &ContactId) -> Result<(), DeleteError> {
        self.store.delete(id)
    }
}
