use pairline::error::{ChatError, RetryPolicy};
use pairline::matchqueue::EnqueueOutcome;
use pairline::model::{MemberRole, TicketStatus};
use pairline::{chats, db, groups, matchqueue, moderation, presence, stats, tickets};

/// Two strangers meet through the queue, talk, and part ways.
#[test]
fn random_chat_journey() {
    let mut conn = db::init_db(":memory:").unwrap();
    let retry = RetryPolicy::default();

    // Ann searches first and waits
    let out = matchqueue::enqueue(&mut conn, "ann", "Ann", &retry).unwrap();
    assert!(matches!(out, EnqueueOutcome::Waiting(_)));

    // Ben searches and is paired with Ann; the queue drains
    let EnqueueOutcome::Paired(chat) = matchqueue::enqueue(&mut conn, "ben", "Ben", &retry).unwrap()
    else {
        panic!("expected pairing");
    };
    assert_eq!(matchqueue::queue_len(&conn).unwrap(), 0);
    assert!(chat.has_participant("ann") && chat.has_participant("ben"));

    // they exchange messages; order is stable
    let m1 = chats::send_message(&mut conn, &chat.id, "ann", "hi!").unwrap();
    chats::send_message(&mut conn, &chat.id, "ben", "hey").unwrap();
    chats::mark_read(&conn, &chat.id, &m1.id, "ben").unwrap();
    let msgs = chats::list_messages(&conn, &chat.id, 10).unwrap();
    assert_eq!(msgs.len(), 2);
    assert!(msgs.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(msgs[0].read_by, vec!["ben".to_string()]);

    // Ben reports, then ends; the chat is terminal
    chats::report(&conn, &chat.id, "ben", "rude").unwrap();
    chats::end(&conn, &chat.id, "ben").unwrap();
    chats::end(&conn, &chat.id, "ann").unwrap();
    assert!(matches!(
        chats::send_message(&mut conn, &chat.id, "ann", "wait"),
        Err(ChatError::InvalidState(_))
    ));
    assert_eq!(
        moderation::list_reports(&conn, &chat.id.to_string())
            .unwrap()
            .len(),
        1
    );

    // both sides' aggregates moved exactly once
    let ann = stats::for_user(&conn, "ann").unwrap();
    assert_eq!(ann.messages_sent, 1);
    assert_eq!(ann.chats_completed, 1);
    let ben = stats::for_user(&conn, "ben").unwrap();
    assert_eq!(ben.chats_completed, 1);

    // both are free to search again
    assert!(matches!(
        matchqueue::enqueue(&mut conn, "ann", "Ann", &retry).unwrap(),
        EnqueueOutcome::Waiting(_)
    ));
}

/// A public group grows, hands over admin, and shrinks.
#[test]
fn group_membership_journey() {
    let mut conn = db::init_db(":memory:").unwrap();
    let group = groups::create(
        &mut conn,
        "ann",
        "Ann",
        &groups::NewGroup {
            name: "Hikers".into(),
            description: String::new(),
            is_public: true,
            is_anonymous: false,
            avatar_url: None,
            tags: Some("outdoors".into()),
        },
    )
    .unwrap();

    // Ben joins explicitly, Cam joins implicitly by posting
    assert!(groups::join(&mut conn, &group.id, "ben", "Ben").unwrap());
    groups::post(&mut conn, &group.id, "cam", "Cam", "anyone up for Saturday?").unwrap();
    let g = groups::get(&conn, &group.id).unwrap();
    assert_eq!(g.member_count, 3);
    assert_eq!(g.last_message.as_deref(), Some("anyone up for Saturday?"));

    // sole admin is pinned until Ben is promoted
    assert!(matches!(
        groups::leave(&mut conn, &group.id, "ann", "Ann"),
        Err(ChatError::InvalidState(_))
    ));
    groups::set_role(&mut conn, &group.id, "ann", "ben", MemberRole::Admin).unwrap();
    groups::leave(&mut conn, &group.id, "ann", "Ann").unwrap();
    assert_eq!(groups::get(&conn, &group.id).unwrap().member_count, 2);
    assert!(groups::groups_for_user(&conn, "ann").unwrap().is_empty());

    // lifecycle left a create + two joins + one leave in the stream
    let system: Vec<_> = groups::list_messages(&conn, &group.id, 50)
        .unwrap()
        .into_iter()
        .filter(|m| m.sender_id == "system")
        .collect();
    assert_eq!(system.len(), 4);
}

/// Staff triage moves tickets forward only.
#[test]
fn support_ticket_journey() {
    let conn = db::init_db(":memory:").unwrap();
    let ticket = tickets::create(&conn, "ann", "I was paired with a bot").unwrap();
    let ticket = tickets::assign(&conn, &ticket.id, "staff1").unwrap();
    assert_eq!(ticket.status, TicketStatus::Processing);
    let ticket = tickets::resolve(&conn, &ticket.id, "staff1", "fixed").unwrap();
    assert_eq!(ticket.status, TicketStatus::Resolved);
    assert_eq!(ticket.response.as_deref(), Some("fixed"));
    assert!(matches!(
        tickets::reject(&conn, &ticket.id, "staff2"),
        Err(ChatError::InvalidState(_))
    ));
    let open = tickets::list(&conn, Some(TicketStatus::New)).unwrap();
    assert!(open.is_empty());
}

/// Presence is a hint, not a lock: stale online records read as offline.
#[test]
fn presence_staleness() {
    let conn = db::init_db(":memory:").unwrap();
    presence::heartbeat(&conn, "ann").unwrap();
    assert!(presence::status(&conn, "ann").unwrap().is_online);
    let later = time::OffsetDateTime::now_utc().unix_timestamp() + presence::STALE_AFTER_SECS + 1;
    assert!(!presence::status_at(&conn, "ann", later).unwrap().is_online);
    presence::mark_offline(&conn, "ann").unwrap();
    assert!(!presence::status(&conn, "ann").unwrap().is_online);
}
