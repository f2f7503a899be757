use bson::oid::ObjectId;
use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};

use super::error::Result;
use super::models::{CountFilter, MessageStat, TimeRange};
use super::store::MessageStore;

/// Start of the local day containing `now`, as a UTC instant.
pub fn local_midnight(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local = now.with_timezone(&offset);
    now - Duration::seconds(local.num_seconds_from_midnight() as i64)
        - Duration::nanoseconds(local.nanosecond() as i64)
}

/// Message counts bucketed by local calendar day relative to `now`.
/// `week` and `month` are the 7 and 30 days before today's midnight.
pub async fn message_stat<S: MessageStore + ?Sized>(
    store: &S,
    conversation: Option<ObjectId>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> Result<MessageStat> {
    let midnight = local_midnight(now, offset);
    let day = Duration::days(1);
    let count = |range: TimeRange| {
        store.count_messages(CountFilter {
            conversation,
            range,
        })
    };

    let (today, yesterday, before_yesterday, week, month, earlier) = futures::try_join!(
        count(TimeRange::since(midnight)),
        count(TimeRange::between(midnight - day, midnight)),
        count(TimeRange::between(midnight - day * 2, midnight - day)),
        count(TimeRange::between(midnight - day * 7, midnight)),
        count(TimeRange::between(midnight - day * 30, midnight)),
        count(TimeRange::until(midnight - day * 30)),
    )?;

    log::debug!(
        "Message stat for {:?}: {} today, {} total before today",
        conversation,
        today,
        month + earlier
    );
    Ok(MessageStat {
        today,
        yesterday,
        before_yesterday,
        week,
        month,
        earlier,
    })
}
