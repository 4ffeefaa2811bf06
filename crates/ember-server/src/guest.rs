//! Guest identities.
//!
//! Visitors without a token get a generated fantasy nick ending in
//! `(guest)`. When the room allows guests the nick doubles as the user id;
//! otherwise the id stays empty and the session is read-only.

use ember_core::{Room, Tags, User};
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "Amber", "Ancient", "Bold", "Bright", "Clever", "Copper", "Crimson", "Daring", "Dusky",
    "Ember", "Feral", "Gentle", "Gilded", "Hidden", "Iron", "Ivory", "Jade", "Keen", "Lunar",
    "Misty", "Nimble", "Obsidian", "Pale", "Quiet", "Restless", "Silver", "Swift", "Thorny",
    "Umber", "Wandering",
];

const CREATURES: &[&str] = &[
    "Basilisk", "Centaur", "Chimera", "Djinn", "Dragon", "Dryad", "Gargoyle", "Gryphon",
    "Harpy", "Hydra", "Kelpie", "Kirin", "Kraken", "Lindworm", "Manticore", "Minotaur",
    "Naiad", "Phoenix", "Roc", "Salamander", "Selkie", "Sphinx", "Sprite", "Troll", "Unicorn",
    "Valkyrie", "Wisp", "Wyrm", "Wyvern", "Zephyr",
];

/// Generate a fresh guest nick.
#[must_use]
pub fn guest_nick() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Wandering");
    let creature = CREATURES.choose(&mut rng).unwrap_or(&"Wisp");
    format!("{adjective} {creature} (guest)")
}

/// Build a guest user for `room`: the nick doubles as the id iff the room
/// admits guests.
#[must_use]
pub fn guest_user(room: &Room) -> User {
    let nick = guest_nick();
    let id = if room.allows_guests() {
        nick.clone()
    } else {
        String::new()
    };
    User {
        id,
        nick,
        language: String::new(),
        tags: Tags::new(),
        last_online: chrono::DateTime::UNIX_EPOCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::model::TAG_ALLOW_GUESTS;

    #[test]
    fn nick_carries_the_guest_marker() {
        let nick = guest_nick();
        assert!(nick.ends_with(" (guest)"));
        assert!(nick.split_whitespace().count() >= 3);
    }

    #[test]
    fn id_follows_the_room_policy() {
        let mut room = Room::new("default", User::new("admin", "admin"));
        let readonly = guest_user(&room);
        assert!(readonly.id.is_empty());
        assert!(!readonly.can_post());

        room.tags.insert(TAG_ALLOW_GUESTS.into(), "true".into());
        let posting = guest_user(&room);
        assert_eq!(posting.id, posting.nick);
        assert!(posting.can_post());
    }
}
