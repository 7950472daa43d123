/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Computes the deduplicated destination-inbox set for one rendered
//! activity and turns it into delivery jobs. Reachability is NOT checked
//! here; jobs for dead hosts are enqueued like any other and the worker
//! deals with them.

use crate::delivery_queue::DeliveryQueue;
use crate::social_db::{SocialDb, User};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;

pub struct DeliverManager<'a> {
    social: &'a SocialDb,
    author: &'a User,
    activity: Value,
    direct_inboxes: Vec<String>,
    followers: bool,
    relay_inboxes: Vec<String>,
}

impl<'a> DeliverManager<'a> {
    pub fn new(social: &'a SocialDb, author: &'a User, activity: Value) -> Self {
        Self {
            social,
            author,
            activity,
            direct_inboxes: Vec::new(),
            followers: false,
            relay_inboxes: Vec::new(),
        }
    }

    /// One explicitly addressed remote user (mention, reply target author,
    /// renote target author).
    pub fn add_direct_recipe(&mut self, user: &User) {
        if let Some(inbox) = user.inbox() {
            if !inbox.is_empty() {
                self.direct_inboxes.push(inbox.to_string());
            }
        }
    }

    /// Expand the author's remote followers at send time.
    pub fn add_followers_recipe(&mut self) {
        self.followers = true;
    }

    pub fn add_relays_recipe(&mut self, relay_inboxes: Vec<String>) {
        self.relay_inboxes.extend(relay_inboxes);
    }

    /// The deduplicated inbox set. Followers on a host that publishes a
    /// shared endpoint collapse onto it, and the shared endpoint wins over
    /// individual inboxes for that host; dedupe key is the endpoint URL.
    pub fn compute_inboxes(&self) -> Result<Vec<String>> {
        let mut inboxes: Vec<String> = Vec::new();
        let mut push = |url: String, inboxes: &mut Vec<String>| {
            if !url.is_empty() && !inboxes.contains(&url) {
                inboxes.push(url);
            }
        };

        if self.followers {
            let followers = self.social.list_remote_follower_inboxes(&self.author.id)?;
            let mut by_host: HashMap<String, Vec<&crate::social_db::FollowerInbox>> =
                HashMap::new();
            for f in &followers {
                by_host.entry(f.host.clone()).or_default().push(f);
            }
            for (_host, group) in by_host {
                match group.iter().find_map(|f| f.shared_inbox.clone()) {
                    Some(shared) => push(shared, &mut inboxes),
                    None => {
                        for f in group {
                            if let Some(inbox) = f.inbox.clone() {
                                push(inbox, &mut inboxes);
                            }
                        }
                    }
                }
            }
        }

        for inbox in &self.direct_inboxes {
            push(inbox.clone(), &mut inboxes);
        }
        for inbox in &self.relay_inboxes {
            push(inbox.clone(), &mut inboxes);
        }

        Ok(inboxes)
    }

    /// Enqueue one job per inbox; returns the number of jobs created.
    pub async fn execute(self, queue: &DeliveryQueue) -> Result<u64> {
        let inboxes = self.compute_inboxes()?;
        if inboxes.is_empty() {
            return Ok(0);
        }
        let n = inboxes.len() as u64;
        let body = serde_json::to_vec(&self.activity)?;
        queue
            .enqueue_activity(body, inboxes, self.author.id.clone())
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::social_db::tests::{local_user, remote_user, temp_db};
    use serde_json::json;

    #[test]
    fn shared_inbox_collapses_same_host_followers() {
        let db = temp_db();
        let author = local_user("u1", "alice");
        db.upsert_user(&author).unwrap();

        let f1 = remote_user("r1", "bob", "remote.example", true);
        let f2 = remote_user("r2", "carol", "remote.example", true);
        let f3 = remote_user("r3", "dave", "other.example", false);
        for f in [&f1, &f2, &f3] {
            db.upsert_user(f).unwrap();
            db.add_following(f, "u1").unwrap();
        }

        let mut dm = DeliverManager::new(&db, &author, json!({"type": "Create"}));
        dm.add_followers_recipe();
        let mut inboxes = dm.compute_inboxes().unwrap();
        inboxes.sort();
        assert_eq!(
            inboxes,
            vec![
                "https://other.example/users/dave/inbox".to_string(),
                "https://remote.example/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn shared_endpoint_wins_over_individual_on_same_host() {
        let db = temp_db();
        let author = local_user("u1", "alice");
        db.upsert_user(&author).unwrap();

        // One follower without a shared inbox, one with: the host collapses
        // onto the shared endpoint.
        let plain = remote_user("r1", "bob", "remote.example", false);
        let shared = remote_user("r2", "carol", "remote.example", true);
        for f in [&plain, &shared] {
            db.upsert_user(f).unwrap();
            db.add_following(f, "u1").unwrap();
        }

        let mut dm = DeliverManager::new(&db, &author, json!({"type": "Create"}));
        dm.add_followers_recipe();
        assert_eq!(
            dm.compute_inboxes().unwrap(),
            vec!["https://remote.example/inbox".to_string()]
        );
    }

    #[test]
    fn direct_and_relay_recipients_dedupe() {
        let db = temp_db();
        let author = local_user("u1", "alice");
        db.upsert_user(&author).unwrap();

        let bob = remote_user("r1", "bob", "remote.example", false);
        let mut dm = DeliverManager::new(&db, &author, json!({"type": "Create"}));
        dm.add_direct_recipe(&bob);
        dm.add_direct_recipe(&bob);
        dm.add_relays_recipe(vec![
            "https://relay.example/inbox".to_string(),
            "https://relay.example/inbox".to_string(),
        ]);
        assert_eq!(
            dm.compute_inboxes().unwrap(),
            vec![
                "https://remote.example/users/bob/inbox".to_string(),
                "https://relay.example/inbox".to_string(),
            ]
        );
    }

    #[test]
    fn no_recipes_no_inboxes() {
        let db = temp_db();
        let author = local_user("u1", "alice");
        let dm = DeliverManager::new(&db, &author, json!({"type": "Create"}));
        assert!(dm.compute_inboxes().unwrap().is_empty());
    }
}
