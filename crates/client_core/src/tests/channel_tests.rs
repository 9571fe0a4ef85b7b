use shared::domain::{ChannelMute, Reaction};

use super::*;
use crate::test_support::{at, cid, message, message_new, reaction_new, typing};

fn logic_for(user: &str) -> ChannelLogic {
    let global_state = Arc::new(GlobalState::new());
    global_state.set_user(User::new(user));
    ChannelLogic::new(cid("messaging:1"), global_state)
}

fn ids(state: &ChannelState) -> Vec<String> {
    state
        .messages()
        .iter()
        .map(|message| message.id.to_string())
        .collect()
}

#[test]
fn messages_stay_ordered_and_unique() {
    let logic = logic_for("jc");
    let state = logic.state();

    logic.handle_events(&[
        message_new("messaging:1", message("m3", "b", 3), 3),
        message_new("messaging:1", message("m1", "b", 1), 1),
        message_new("messaging:1", message("m2", "b", 2), 2),
    ]);
    let mut edited = message("m2", "b", 2);
    edited.text = "edited".into();
    logic.handle_event(&ChatEvent::MessageUpdated {
        created_at: at(4),
        cid: cid("messaging:1"),
        user: User::new("b"),
        message: edited,
    });

    assert_eq!(ids(&state), vec!["m1", "m2", "m3"]);
    let snapshot = state.snapshot();
    assert_eq!(
        snapshot
            .message(&MessageId::from("m2"))
            .map(|m| m.text.as_str()),
        Some("edited")
    );
}

#[test]
fn batch_notifies_subscribers_once() {
    let logic = logic_for("jc");
    let mut receiver = logic.state().subscribe();
    assert!(!receiver.has_changed().expect("open"));

    logic.handle_events(&[
        message_new("messaging:1", message("m1", "b", 1), 1),
        typing("messaging:1", "b", 2),
    ]);

    assert!(receiver.has_changed().expect("open"));
    receiver.borrow_and_update();
    assert!(!receiver.has_changed().expect("open"));
}

#[test]
fn hard_delete_removes_and_soft_delete_keeps() {
    let logic = logic_for("jc");
    logic.handle_events(&[
        message_new("messaging:1", message("m1", "b", 1), 1),
        message_new("messaging:1", message("m2", "b", 2), 2),
    ]);

    let delete = |id: &str, hard_delete: bool| ChatEvent::MessageDeleted {
        created_at: at(9),
        cid: cid("messaging:1"),
        user: None,
        message: message(id, "b", 1),
        hard_delete,
    };
    logic.handle_events(&[delete("m1", true), delete("m2", false)]);

    let state = logic.state();
    assert_eq!(ids(&state), vec!["m2"]);
    assert_eq!(state.messages()[0].deleted_at, Some(at(9)));
}

#[test]
fn reaction_events_replace_the_message() {
    let logic = logic_for("a");
    logic.handle_event(&message_new("messaging:1", message("m1", "b", 1), 1));

    let mut reacted = message("m1", "b", 1);
    reacted.latest_reactions = vec![Reaction::new("m1", "a", "like")];
    reacted.reaction_counts.insert("like".into(), 1);
    logic.handle_event(&reaction_new(
        "messaging:1",
        reacted,
        Reaction::new("m1", "a", "like"),
        2,
    ));

    let messages = logic.state().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].reaction_counts.get("like"), Some(&1));
}

#[test]
fn typing_starts_and_stops() {
    let logic = logic_for("jc");
    logic.handle_events(&[typing("messaging:1", "b", 1), typing("messaging:1", "c", 2)]);
    logic.handle_event(&ChatEvent::TypingStop {
        created_at: at(3),
        cid: cid("messaging:1"),
        user: User::new("b"),
    });

    let typing: Vec<_> = logic.state().snapshot().typing.into_iter().collect();
    assert_eq!(typing, vec![UserId::from("c")]);
}

#[test]
fn truncation_and_cleared_history_drop_older_messages() {
    let logic = logic_for("jc");
    logic.handle_events(&[
        message_new("messaging:1", message("m1", "b", 1), 1),
        message_new("messaging:1", message("m2", "b", 5), 5),
        message_new("messaging:1", message("m3", "b", 9), 9),
    ]);

    logic.handle_event(&ChatEvent::ChannelTruncated {
        created_at: at(3),
        cid: cid("messaging:1"),
        channel: Channel::new(cid("messaging:1")),
        user: None,
    });
    assert_eq!(ids(&logic.state()), vec!["m2", "m3"]);

    logic.handle_event(&ChatEvent::ChannelHidden {
        created_at: at(7),
        cid: cid("messaging:1"),
        user: User::new("jc"),
        clear_history: true,
    });
    let snapshot = logic.state().snapshot();
    assert!(snapshot.hidden);
    assert_eq!(snapshot.messages.len(), 1);

    logic.handle_event(&message_new("messaging:1", message("m4", "b", 10), 10));
    assert!(!logic.state().snapshot().hidden);
}

#[test]
fn mark_all_read_only_applies_to_the_current_user() {
    let logic = logic_for("jc");
    let mark_all_read = |user: &str, seconds| ChatEvent::MarkAllRead {
        created_at: at(seconds),
        user: User::new(user),
        total_unread_count: 0,
        unread_channels: 0,
    };
    logic.handle_events(&[mark_all_read("other", 1), mark_all_read("jc", 2)]);

    let reads = logic.state().snapshot().reads;
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[&UserId::from("jc")].last_read, at(2));
}

#[test]
fn channel_mutes_toggle_muted() {
    let logic = logic_for("jc");
    let mut me = User::new("jc");
    me.channel_mutes = vec![ChannelMute {
        cid: cid("messaging:1"),
        created_at: None,
        expires: None,
    }];
    logic.handle_event(&ChatEvent::NotificationChannelMutesUpdated {
        created_at: at(1),
        me,
    });
    assert!(logic.state().snapshot().muted);

    logic.handle_event(&ChatEvent::NotificationChannelMutesUpdated {
        created_at: at(2),
        me: User::new("jc"),
    });
    assert!(!logic.state().snapshot().muted);
}

#[test]
fn membership_follows_the_current_user() {
    let logic = logic_for("jc");
    let member_added = |user: &str| ChatEvent::MemberAdded {
        created_at: at(1),
        cid: cid("messaging:1"),
        user: User::new(user),
        member: Member::new(User::new(user)),
    };
    logic.handle_events(&[member_added("jc"), member_added("b")]);

    let state = logic.state();
    assert!(state.has_member(&UserId::from("b")));
    assert!(state.snapshot().membership.is_some());
    assert_eq!(state.snapshot().member_count, 2);

    let mut online = User::new("b");
    online.online = true;
    logic.handle_event(&ChatEvent::UserPresenceChanged {
        created_at: at(2),
        user: online,
    });
    assert!(state.members().iter().any(|member| member.user.online));

    logic.handle_event(&ChatEvent::MemberRemoved {
        created_at: at(3),
        cid: cid("messaging:1"),
        user: User::new("jc"),
    });
    assert!(state.snapshot().membership.is_none());
    assert_eq!(state.members().len(), 1);
}

#[test]
fn seeding_from_storage_keeps_message_order() {
    let logic = logic_for("jc");
    let mut channel = Channel::new(cid("messaging:1"));
    channel.name = "general".into();
    channel.member_count = 4;

    logic.update_data_from_channel(
        &channel,
        vec![message("m2", "b", 2), message("m1", "b", 1)],
    );

    let snapshot = logic.state().snapshot();
    assert_eq!(snapshot.name, "general");
    assert_eq!(snapshot.member_count, 4);
    assert_eq!(ids(&logic.state()), vec!["m1", "m2"]);
}
