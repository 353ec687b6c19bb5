//! Diesel TEXT mappings for the label enums and `ActionItems`.

use diesel::deserialize::{self, FromSql};
use diesel::pg::{Pg, PgValue};
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use std::io::Write;

use crate::{ActionItems, Sentiment, Urgency};

fn read_text(bytes: PgValue<'_>) -> deserialize::Result<String> {
    <String as FromSql<Text, Pg>>::from_sql(bytes)
}

impl FromSql<Text, Pg> for Sentiment {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let s = read_text(bytes)?;
        Sentiment::from_label(&s).ok_or_else(|| format!("unknown sentiment label: {s}").into())
    }
}

impl ToSql<Text, Pg> for Sentiment {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for Urgency {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let s = read_text(bytes)?;
        Urgency::from_label(&s).ok_or_else(|| format!("unknown urgency label: {s}").into())
    }
}

impl ToSql<Text, Pg> for Urgency {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        out.write_all(self.as_str().as_bytes())?;
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Pg> for ActionItems {
    fn from_sql(bytes: PgValue<'_>) -> deserialize::Result<Self> {
        let s = read_text(bytes)?;
        let items: Vec<String> = serde_json::from_str(&s)
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
        Ok(ActionItems(items))
    }
}

impl ToSql<Text, Pg> for ActionItems {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Pg>) -> serialize::Result {
        let s = serde_json::to_string(&self.0)?;
        out.write_all(s.as_bytes())?;
        Ok(IsNull::No)
    }
}
