//! Domain-knowledge documents: long-lived user reference material injected
//! into the cached zone of the system prompt.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use mira_domain::{Error, Result};

use crate::events::TrinketContext;
use crate::trinkets::Trinket;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainDoc {
    pub id: Uuid,
    pub user_id: Uuid,
    pub label: String,
    pub content: String,
}

#[derive(Default)]
pub struct DomainDocStore {
    docs: RwLock<HashMap<Uuid, DomainDoc>>,
}

impl DomainDocStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, user_id: Uuid, label: &str, content: &str) -> DomainDoc {
        let doc = DomainDoc {
            id: Uuid::new_v4(),
            user_id,
            label: label.into(),
            content: content.into(),
        };
        self.docs.write().insert(doc.id, doc.clone());
        doc
    }

    pub fn remove(&self, id: &Uuid) -> Result<()> {
        self.docs
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("domain doc {id}")))
    }

    pub fn for_user(&self, user_id: &Uuid) -> Vec<DomainDoc> {
        let mut list: Vec<DomainDoc> = self
            .docs
            .read()
            .values()
            .filter(|d| &d.user_id == user_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.label.cmp(&b.label));
        list
    }
}

pub struct DomainDocTrinket {
    store: Arc<DomainDocStore>,
}

impl DomainDocTrinket {
    pub fn new(store: Arc<DomainDocStore>) -> Self {
        Self { store }
    }
}

impl Trinket for DomainDocTrinket {
    fn name(&self) -> &'static str {
        "DomainDocTrinket"
    }

    fn variable_name(&self) -> &'static str {
        "domaindoc"
    }

    fn cache_policy(&self) -> bool {
        // Reference docs change rarely; keep them in the cached prefix.
        true
    }

    fn generate_content(&self, context: &TrinketContext) -> Result<String> {
        let docs = self.store.for_user(&context.user.user_id);
        if docs.is_empty() {
            return Ok(String::new());
        }
        let mut parts = vec!["<domain_knowledge>".to_string()];
        for doc in docs {
            parts.push(format!("<doc label=\"{}\">", doc.label));
            parts.push(doc.content);
            parts.push("</doc>".into());
        }
        parts.push("</domain_knowledge>".into());
        Ok(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_domain::message::UserContext;

    #[test]
    fn renders_user_docs_sorted_by_label() {
        let store = Arc::new(DomainDocStore::new());
        let user = Uuid::new_v4();
        store.add(user, "work", "Team roster and projects");
        store.add(user, "home", "House maintenance notes");

        let trinket = DomainDocTrinket::new(store);
        let ctx = TrinketContext {
            user: UserContext { user_id: user, ..Default::default() },
            ..Default::default()
        };
        let content = trinket.generate_content(&ctx).unwrap();
        assert!(trinket.cache_policy());
        let home = content.find("label=\"home\"").unwrap();
        let work = content.find("label=\"work\"").unwrap();
        assert!(home < work);
    }
}
