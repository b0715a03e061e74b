//! Status transitions, the check-in log and the statistics built from them.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, Row};
use tracing::{debug, info};

use super::attendees::fetch_attendee;
use super::{conversion_error, from_db_time, to_db_time, Storage};
use crate::error::{Error, Result};
use crate::models::{
    Attendee, AttendeeStatus, CheckinAction, CheckinLog, CheckinMethod, DashboardOverview,
    EventStats, EventSummary, HourBucket, LogAction, Transition,
};

const LOG_COLUMNS: &str = "id, event_id, attendee_id, student_id, full_name, action, \
     from_status, to_status, method, performed_by, created_at";

/// Result of a check-in, check-out or reset request.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    /// The attendee after the request.
    pub attendee: Attendee,
    pub transition: Transition,
    /// The log row written, `None` when nothing changed.
    pub log: Option<CheckinLog>,
}

impl TransitionOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.log.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct StatusCounts {
    pending: i64,
    checked_in: i64,
    checked_out: i64,
}

impl StatusCounts {
    fn total(self) -> i64 {
        self.pending + self.checked_in + self.checked_out
    }
}

impl Storage {
    /// Move an attendee along its lifecycle and log the change.
    ///
    /// The status update and the log row are written in one transaction.
    /// A request that leaves the status as it was writes nothing. An `auto`
    /// scan of someone who checked in less than `cooldown` ago counts as a
    /// repeated check-in rather than a check-out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown attendee and
    /// [`Error::InvalidTransition`] when the action is not allowed from the
    /// current status.
    #[allow(clippy::too_many_arguments)]
    pub fn record_transition(
        &mut self,
        event_id: i64,
        attendee_id: i64,
        action: CheckinAction,
        method: CheckinMethod,
        actor: Option<i64>,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Result<TransitionOutcome> {
        let tx = self.conn.transaction()?;
        let attendee =
            fetch_attendee(&tx, event_id, attendee_id)?.ok_or(Error::NotFound { entity: "attendee" })?;

        let effective = match (action, attendee.status, attendee.checked_in_at) {
            (CheckinAction::Auto, AttendeeStatus::CheckedIn, Some(at)) if now - at < cooldown => {
                debug!(attendee_id, "Repeated scan inside cooldown, keeping check-in");
                CheckinAction::CheckIn
            }
            _ => action,
        };

        let transition = attendee.status.apply(effective)?;
        let Transition::Applied { from, to } = transition else {
            return Ok(TransitionOutcome {
                attendee,
                transition,
                log: None,
            });
        };

        let stamp = to_db_time(now);
        let column = match to {
            AttendeeStatus::CheckedOut => "checked_out_at",
            _ => "checked_in_at",
        };
        tx.execute(
            &format!("UPDATE attendees SET status = ?1, {column} = ?2, updated_at = ?2 WHERE id = ?3"),
            params![to.as_str(), stamp, attendee_id],
        )?;

        let log = insert_log(&tx, &attendee, from, to, method, actor, now)?;
        let attendee =
            fetch_attendee(&tx, event_id, attendee_id)?.ok_or(Error::NotFound { entity: "attendee" })?;
        tx.commit()?;

        info!(
            event_id,
            attendee_id,
            from = from.as_str(),
            to = to.as_str(),
            method = method.as_str(),
            "Recorded transition"
        );
        Ok(TransitionOutcome {
            attendee,
            transition,
            log: Some(log),
        })
    }

    /// Put an attendee back to pending and clear both timestamps.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown attendee.
    pub fn reset_attendee(
        &mut self,
        event_id: i64,
        attendee_id: i64,
        actor: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let tx = self.conn.transaction()?;
        let attendee =
            fetch_attendee(&tx, event_id, attendee_id)?.ok_or(Error::NotFound { entity: "attendee" })?;

        if attendee.status == AttendeeStatus::Pending {
            return Ok(TransitionOutcome {
                transition: Transition::Unchanged(AttendeeStatus::Pending),
                attendee,
                log: None,
            });
        }

        let from = attendee.status;
        tx.execute(
            r"
            UPDATE attendees
            SET status = 'pending', checked_in_at = NULL, checked_out_at = NULL, updated_at = ?1
            WHERE id = ?2
            ",
            params![to_db_time(now), attendee_id],
        )?;
        let log = insert_log(
            &tx,
            &attendee,
            from,
            AttendeeStatus::Pending,
            CheckinMethod::Admin,
            actor,
            now,
        )?;
        let attendee =
            fetch_attendee(&tx, event_id, attendee_id)?.ok_or(Error::NotFound { entity: "attendee" })?;
        tx.commit()?;

        info!(event_id, attendee_id, from = from.as_str(), "Reset attendee");
        Ok(TransitionOutcome {
            attendee,
            transition: Transition::Applied {
                from,
                to: AttendeeStatus::Pending,
            },
            log: Some(log),
        })
    }

    /// Newest log rows of an event first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent_logs(&self, event_id: i64, limit: usize) -> Result<Vec<CheckinLog>> {
        self.recent_logs_for_events(&[event_id], limit)
    }

    /// Newest log rows across several events.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn recent_logs_for_events(&self, event_ids: &[i64], limit: usize) -> Result<Vec<CheckinLog>> {
        if event_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; event_ids.len()].join(", ");
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM checkin_logs WHERE event_id IN ({placeholders}) \
             ORDER BY created_at DESC, id DESC LIMIT {limit}"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let logs = stmt
            .query_map(params_from_iter(event_ids.iter()), row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    /// Attendance numbers for one event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn event_stats(
        &self,
        event_id: i64,
        recent_limit: usize,
        now: DateTime<Utc>,
    ) -> Result<EventStats> {
        let counts = self.status_counts(event_id)?;

        let mut stmt = self.conn.prepare(
            r"
            SELECT substr(created_at, 1, 13) AS hour,
                   SUM(CASE WHEN action = 'check_in' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN action = 'check_out' THEN 1 ELSE 0 END)
            FROM checkin_logs
            WHERE event_id = ?1 AND action IN ('check_in', 'check_out')
            GROUP BY hour
            ORDER BY hour
            ",
        )?;
        let hourly = stmt
            .query_map([event_id], |row| {
                let hour: String = row.get(0)?;
                Ok(HourBucket {
                    hour: format!("{hour}:00"),
                    check_ins: row.get(1)?,
                    check_outs: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(EventStats {
            event_id,
            total: counts.total(),
            pending: counts.pending,
            checked_in: counts.checked_in,
            checked_out: counts.checked_out,
            attendance_rate: EventStats::rate(counts.checked_in, counts.checked_out, counts.total()),
            hourly,
            recent: self.recent_logs(event_id, recent_limit)?,
            generated_at: now,
        })
    }

    /// Totals across every event the user can see.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn dashboard_overview(
        &self,
        user_id: i64,
        recent_limit: usize,
        now: DateTime<Utc>,
    ) -> Result<DashboardOverview> {
        let events = self.list_events_for_user(user_id)?;
        let mut summaries = Vec::with_capacity(events.len());
        let mut ids = Vec::with_capacity(events.len());

        for (event, access) in events {
            let counts = self.status_counts(event.id)?;
            ids.push(event.id);
            summaries.push(EventSummary {
                permissions: access.effective(),
                total: counts.total(),
                checked_in: counts.checked_in,
                checked_out: counts.checked_out,
                attendance_rate: EventStats::rate(
                    counts.checked_in,
                    counts.checked_out,
                    counts.total(),
                ),
                event,
            });
        }

        Ok(DashboardOverview {
            total_events: summaries.len(),
            total_attendees: summaries.iter().map(|s| s.total).sum(),
            total_checked_in: summaries.iter().map(|s| s.checked_in).sum(),
            total_checked_out: summaries.iter().map(|s| s.checked_out).sum(),
            recent: self.recent_logs_for_events(&ids, recent_limit)?,
            events: summaries,
            generated_at: now,
        })
    }

    fn status_counts(&self, event_id: i64) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM attendees WHERE event_id = ?1 GROUP BY status")?;
        let rows = stmt.query_map([event_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            match status.parse::<AttendeeStatus>()? {
                AttendeeStatus::Pending => counts.pending = count,
                AttendeeStatus::CheckedIn => counts.checked_in = count,
                AttendeeStatus::CheckedOut => counts.checked_out = count,
            }
        }
        Ok(counts)
    }
}

fn insert_log(
    conn: &Connection,
    attendee: &Attendee,
    from: AttendeeStatus,
    to: AttendeeStatus,
    method: CheckinMethod,
    actor: Option<i64>,
    now: DateTime<Utc>,
) -> Result<CheckinLog> {
    let action = LogAction::for_status(to);
    conn.execute(
        r"
        INSERT INTO checkin_logs (event_id, attendee_id, student_id, full_name, action,
                                  from_status, to_status, method, performed_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ",
        params![
            attendee.event_id,
            attendee.id,
            attendee.student_id,
            attendee.full_name,
            action.as_str(),
            from.as_str(),
            to.as_str(),
            method.as_str(),
            actor,
            to_db_time(now),
        ],
    )?;

    Ok(CheckinLog {
        id: conn.last_insert_rowid(),
        event_id: attendee.event_id,
        attendee_id: Some(attendee.id),
        student_id: attendee.student_id.clone(),
        full_name: attendee.full_name.clone(),
        action,
        from_status: from,
        to_status: to,
        method,
        performed_by: actor,
        // Round-trip through the stored form so callers see what a reload would.
        created_at: from_db_time(10, &to_db_time(now))?,
    })
}

fn row_to_log(row: &Row) -> rusqlite::Result<CheckinLog> {
    let action: String = row.get(5)?;
    let from_status: String = row.get(6)?;
    let to_status: String = row.get(7)?;
    let method: String = row.get(8)?;
    let created_at: String = row.get(10)?;

    Ok(CheckinLog {
        id: row.get(0)?,
        event_id: row.get(1)?,
        attendee_id: row.get(2)?,
        student_id: row.get(3)?,
        full_name: row.get(4)?,
        action: action.parse().map_err(|e| conversion_error(5, e))?,
        from_status: from_status.parse().map_err(|e| conversion_error(6, e))?,
        to_status: to_status.parse().map_err(|e| conversion_error(7, e))?,
        method: method.parse().map_err(|e| conversion_error(8, e))?,
        performed_by: row.get(9)?,
        created_at: from_db_time(10, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{event, new_attendee, storage, tokens, user};
    use super::*;
    use crate::models::Permission;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn cooldown() -> Duration {
        Duration::seconds(60)
    }

    struct Fixture {
        storage: Storage,
        owner_id: i64,
        event_id: i64,
        attendee_id: i64,
    }

    fn fixture() -> Fixture {
        let storage = storage();
        let owner = user(&storage, "owner");
        let ev = event(&storage, &owner);
        let attendee = storage
            .add_attendee(ev.id, &new_attendee("SV01", "Nguyễn An"), tokens())
            .unwrap();
        Fixture {
            owner_id: owner.id,
            event_id: ev.id,
            attendee_id: attendee.id,
            storage,
        }
    }

    impl Fixture {
        fn apply(&mut self, action: CheckinAction, now: &str) -> Result<TransitionOutcome> {
            self.storage.record_transition(
                self.event_id,
                self.attendee_id,
                action,
                CheckinMethod::Qr,
                Some(self.owner_id),
                at(now),
                cooldown(),
            )
        }
    }

    #[test]
    fn test_check_in_records_log() {
        let mut f = fixture();
        let outcome = f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();

        assert!(outcome.changed());
        assert_eq!(outcome.attendee.status, AttendeeStatus::CheckedIn);
        assert_eq!(outcome.attendee.checked_in_at, Some(at("2024-05-20T08:05:00Z")));
        let log = outcome.log.unwrap();
        assert_eq!(log.action, LogAction::CheckIn);
        assert_eq!(log.from_status, AttendeeStatus::Pending);
        assert_eq!(log.performed_by, Some(f.owner_id));

        let logs = f.storage.recent_logs(f.event_id, 10).unwrap();
        assert_eq!(logs, vec![log]);
    }

    #[test]
    fn test_repeated_check_in_writes_nothing() {
        let mut f = fixture();
        f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();
        let again = f.apply(CheckinAction::CheckIn, "2024-05-20T08:30:00Z").unwrap();

        assert!(!again.changed());
        assert_eq!(again.transition, Transition::Unchanged(AttendeeStatus::CheckedIn));
        assert_eq!(again.attendee.checked_in_at, Some(at("2024-05-20T08:05:00Z")));
        assert_eq!(f.storage.recent_logs(f.event_id, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_auto_scan_inside_cooldown_keeps_check_in() {
        let mut f = fixture();
        f.apply(CheckinAction::Auto, "2024-05-20T08:05:00Z").unwrap();
        let second = f.apply(CheckinAction::Auto, "2024-05-20T08:05:30Z").unwrap();

        assert!(!second.changed());
        assert_eq!(second.attendee.status, AttendeeStatus::CheckedIn);
    }

    #[test]
    fn test_auto_scan_after_cooldown_checks_out() {
        let mut f = fixture();
        f.apply(CheckinAction::Auto, "2024-05-20T08:05:00Z").unwrap();
        let out = f.apply(CheckinAction::Auto, "2024-05-20T10:00:00Z").unwrap();

        assert_eq!(out.attendee.status, AttendeeStatus::CheckedOut);
        assert_eq!(out.attendee.checked_out_at, Some(at("2024-05-20T10:00:00Z")));
        assert_eq!(out.log.unwrap().action, LogAction::CheckOut);
    }

    #[test]
    fn test_invalid_transition_leaves_state_alone() {
        let mut f = fixture();
        let err = f.apply(CheckinAction::CheckOut, "2024-05-20T08:05:00Z").unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let attendee = f.storage.get_attendee(f.event_id, f.attendee_id).unwrap().unwrap();
        assert_eq!(attendee.status, AttendeeStatus::Pending);
        assert!(f.storage.recent_logs(f.event_id, 10).unwrap().is_empty());
    }

    #[test]
    fn test_transition_unknown_attendee() {
        let mut f = fixture();
        f.attendee_id = 999;
        let err = f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap_err();
        assert!(matches!(err, Error::NotFound { entity: "attendee" }));
    }

    #[test]
    fn test_reset_returns_to_pending() {
        let mut f = fixture();
        f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();
        f.apply(CheckinAction::CheckOut, "2024-05-20T10:00:00Z").unwrap();

        let reset = f
            .storage
            .reset_attendee(f.event_id, f.attendee_id, Some(f.owner_id), at("2024-05-20T10:01:00Z"))
            .unwrap();
        assert_eq!(reset.attendee.status, AttendeeStatus::Pending);
        assert!(reset.attendee.checked_in_at.is_none());
        assert!(reset.attendee.checked_out_at.is_none());
        let log = reset.log.unwrap();
        assert_eq!(log.action, LogAction::Reset);
        assert_eq!(log.method, CheckinMethod::Admin);

        let again = f
            .storage
            .reset_attendee(f.event_id, f.attendee_id, None, at("2024-05-20T10:02:00Z"))
            .unwrap();
        assert!(!again.changed());

        // Checking in works again after a reset.
        let back = f.apply(CheckinAction::CheckIn, "2024-05-20T10:05:00Z").unwrap();
        assert_eq!(back.attendee.status, AttendeeStatus::CheckedIn);
    }

    #[test]
    fn test_logs_survive_attendee_removal() {
        let mut f = fixture();
        f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();
        f.storage.delete_attendee(f.event_id, f.attendee_id).unwrap();

        let logs = f.storage.recent_logs(f.event_id, 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].attendee_id, None);
        assert_eq!(logs[0].student_id, "SV01");
        assert_eq!(logs[0].full_name, "Nguyễn An");
    }

    #[test]
    fn test_event_stats() {
        let mut f = fixture();
        f.storage
            .add_attendee(f.event_id, &new_attendee("SV02", "Trần Bình"), || "OTHER".into())
            .unwrap();
        f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();
        f.apply(CheckinAction::CheckOut, "2024-05-20T09:40:00Z").unwrap();

        let stats = f.storage.event_stats(f.event_id, 1, at("2024-05-20T09:41:00Z")).unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.checked_in, 0);
        assert_eq!(stats.checked_out, 1);
        assert!((stats.attendance_rate - 50.0).abs() < 1e-9);
        assert_eq!(
            stats.hourly,
            vec![
                HourBucket {
                    hour: "2024-05-20T08:00".into(),
                    check_ins: 1,
                    check_outs: 0
                },
                HourBucket {
                    hour: "2024-05-20T09:00".into(),
                    check_ins: 0,
                    check_outs: 1
                },
            ]
        );
        assert_eq!(stats.recent.len(), 1);
        assert_eq!(stats.recent[0].action, LogAction::CheckOut);
    }

    #[test]
    fn test_dashboard_overview_spans_shared_events() {
        let mut f = fixture();
        f.apply(CheckinAction::CheckIn, "2024-05-20T08:05:00Z").unwrap();

        let helper = user(&f.storage, "helper");
        f.storage
            .upsert_collaborator(f.event_id, helper.id, &[Permission::Checkin])
            .unwrap();
        event(&f.storage, &helper);

        let overview = f
            .storage
            .dashboard_overview(helper.id, 10, at("2024-05-20T09:00:00Z"))
            .unwrap();
        assert_eq!(overview.total_events, 2);
        assert_eq!(overview.total_attendees, 1);
        assert_eq!(overview.total_checked_in, 1);
        assert_eq!(overview.recent.len(), 1);

        let shared = overview
            .events
            .iter()
            .find(|s| s.event.id == f.event_id)
            .unwrap();
        assert_eq!(shared.permissions, vec![Permission::View, Permission::Checkin]);
        assert!((shared.attendance_rate - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_recent_logs_for_no_events() {
        let f = fixture();
        assert!(f.storage.recent_logs_for_events(&[], 10).unwrap().is_empty());
    }
}
