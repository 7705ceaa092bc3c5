// Routing of live DML into the shadow table while a migration copies the
// origin in the background.
//
// For each stripe the copier keeps a cursor: every genid at or before it has
// already been copied, every genid strictly after it will still be copied.
// A DML on the origin therefore only has to be mirrored when it touches the
// copied side of the cursor:
//
//   add     new > cursor           -> nothing, the copier will pick it up
//           new <= cursor          -> mirror add
//   delete  old > cursor           -> nothing, the copier will never see it
//           old <= cursor          -> mirror delete
//   update  old > cur, new > cur   -> nothing
//           old <= cur, new > cur  -> mirror delete(old)
//           old > cur, new <= cur  -> mirror add(new)
//           old <= cur, new <= cur -> mirror update(old -> new)
//
// A zero cursor means the stripe has not been started, so nothing is mirrored.

use log::{debug, error};
use std::sync::Arc;

use crate::error::ScError;
use crate::genid::Genid;
use crate::shadow::{KeyMask, Record, ShadowTable};
use crate::traits::{ShadowWriter, StripeLocator, UpdateKeys};

/// Why a DML was not mirrored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotLive,
    StripeOutOfRange(usize),
    StripeNotStarted,
    AheadOfCursor,
}

/// What the interceptor did with one DML
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAction {
    Skipped(SkipReason),
    Add(Genid),
    Delete(Genid),
    Update { old: Genid, new: Genid },
}

/// Link from an origin table to the shadow it is migrating into
pub struct LiveSync {
    origin: String,
    shadow: Arc<ShadowTable>,
    live: bool,
    locator: Arc<dyn StripeLocator>,
}

impl LiveSync {
    pub fn new(
        origin: &str,
        shadow: Arc<ShadowTable>,
        live: bool,
        locator: Arc<dyn StripeLocator>,
    ) -> Self {
        LiveSync {
            origin: origin.to_string(),
            shadow,
            live,
            locator,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn shadow(&self) -> &Arc<ShadowTable> {
        &self.shadow
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Cursor governing `genid`, or the reason interception is off for it
    fn cursor_for(&self, op: &str, genid: Genid) -> Result<Genid, SkipReason> {
        if !self.live {
            return Err(SkipReason::NotLive);
        }
        let stripe = self.locator.stripe_of(genid);
        let cursor = match self.shadow.cursors.get(stripe) {
            Some(cursor) => cursor,
            None => {
                error!(
                    "{}: genid {} stripe {} out of range!",
                    op, genid, stripe
                );
                return Err(SkipReason::StripeOutOfRange(stripe));
            }
        };
        if cursor.is_zero() {
            return Err(SkipReason::StripeNotStarted);
        }
        Ok(cursor)
    }

    pub fn post_add<W: ShadowWriter>(
        &self,
        writer: &W,
        txn: &mut W::Txn,
        genid: Genid,
        record: &Record,
        keys: KeyMask,
    ) -> Result<MirrorAction, ScError> {
        let cursor = match self.cursor_for("live_sc_post_add", genid) {
            Ok(cursor) => cursor,
            Err(reason) => return Ok(MirrorAction::Skipped(reason)),
        };
        if genid > cursor {
            return Ok(MirrorAction::Skipped(SkipReason::AheadOfCursor));
        }
        writer.add(txn, genid, record, keys)?;
        Ok(MirrorAction::Add(genid))
    }

    pub fn post_delete<W: ShadowWriter>(
        &self,
        writer: &W,
        txn: &mut W::Txn,
        genid: Genid,
        old: &Record,
        keys: KeyMask,
    ) -> Result<MirrorAction, ScError> {
        let cursor = match self.cursor_for("live_sc_post_delete", genid) {
            Ok(cursor) => cursor,
            Err(reason) => return Ok(MirrorAction::Skipped(reason)),
        };
        if genid > cursor {
            return Ok(MirrorAction::Skipped(SkipReason::AheadOfCursor));
        }
        writer.delete(txn, genid, old, keys)?;
        Ok(MirrorAction::Delete(genid))
    }

    /// Both genids are judged against the cursor of the old genid's stripe
    #[allow(clippy::too_many_arguments)]
    pub fn post_update<W: ShadowWriter>(
        &self,
        writer: &W,
        txn: &mut W::Txn,
        old_genid: Genid,
        old: &Record,
        new_genid: Genid,
        new: &Record,
        keys: UpdateKeys<'_>,
    ) -> Result<MirrorAction, ScError> {
        let cursor = match self.cursor_for("live_sc_post_update", old_genid) {
            Ok(cursor) => cursor,
            Err(reason) => return Ok(MirrorAction::Skipped(reason)),
        };

        let old_past = old_genid > cursor;
        let new_past = new_genid > cursor;

        match (old_past, new_past) {
            (true, true) => {
                debug!(
                    "C1: cursor {} ... old {} new {}",
                    cursor, old_genid, new_genid
                );
                Ok(MirrorAction::Skipped(SkipReason::AheadOfCursor))
            }
            (false, true) => {
                debug!(
                    "C2: old {} ... cursor {} ... new {}",
                    old_genid, cursor, new_genid
                );
                writer.delete(txn, old_genid, old, keys.delete)?;
                Ok(MirrorAction::Delete(old_genid))
            }
            (true, false) => {
                debug!(
                    "C3: new {} ... cursor {} ... old {}",
                    new_genid, cursor, old_genid
                );
                writer.add(txn, new_genid, new, keys.insert)?;
                Ok(MirrorAction::Add(new_genid))
            }
            (false, false) => {
                debug!(
                    "C4: old {} new {} ... cursor {}",
                    old_genid, new_genid, cursor
                );
                writer.update(txn, old_genid, old, new_genid, new, keys)?;
                Ok(MirrorAction::Update {
                    old: old_genid,
                    new: new_genid,
                })
            }
        }
    }

    /// Index inserts an update deferred until after its constraint checks
    pub fn delayed_key_adds<W: ShadowWriter>(
        &self,
        writer: &W,
        txn: &mut W::Txn,
        new_genid: Genid,
        record: &Record,
        keys: KeyMask,
    ) -> Result<(), ScError> {
        writer.add_deferred_keys(txn, new_genid, record, keys)
    }
}
