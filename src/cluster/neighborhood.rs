//! Relationship discovery between tag boxes and output boxes.
//!
//! Two boxes are neighbors when one of them grown by the ghost width
//! intersects the other. The first pass is purely local: every rank
//! relates its own tag boxes to the output boxes it knows from the
//! dendrogram run. The second pass, for bidirectional mode, routes each
//! relationship to the rank owning the output box. Send sets and expected
//! receive sets are derived independently on both ends from the holder
//! lists, so the pass terminates without negotiation.

use std::collections::{BTreeMap, BTreeSet};

use crate::comm::Exchange;
use crate::error::ClusterError;
use crate::geometry::BoxId;
use crate::patch::TagPatch;

use super::context::{RunContext, RELATIONSHIP_TAG};
use super::wire::{RelationshipBatch, RelationshipEntry};
use super::{Neighborhood, RelationshipMode};

pub(crate) fn compute_relationships<E: Exchange, P: TagPatch>(
    ctx: &RunContext<'_, P>,
    exchange: &E,
) -> Result<(Neighborhood, Neighborhood), ClusterError> {
    let mut tag_to_new = Neighborhood::new();
    let mut new_to_tag = Neighborhood::new();
    if ctx.params.relationships == RelationshipMode::None {
        return Ok((tag_to_new, new_to_tag));
    }
    let bidirectional = ctx.params.relationships == RelationshipMode::Bidirectional;
    let gcw = &ctx.params.ghost_cell_width;

    // Pass 1: relate local tag boxes to every known output box. Proposals
    // for boxes owned elsewhere are buffered per destination owner.
    let mut outgoing: BTreeMap<usize, RelationshipBatch> = BTreeMap::new();

    for (index, patch) in ctx.patches.iter().enumerate() {
        let tag_box = patch.index_box();
        let tag_id = BoxId {
            owner: ctx.rank,
            seq: index as i32,
        };
        let grown = tag_box.grow(gcw);

        for (new_id, visible) in ctx.visible.iter() {
            if !grown.intersects(&visible.box_) {
                continue;
            }
            tag_to_new
                .entry(tag_id)
                .or_default()
                .insert((*new_id, visible.box_));
            if !bidirectional {
                continue;
            }
            if new_id.owner == ctx.rank {
                new_to_tag
                    .entry(*new_id)
                    .or_default()
                    .insert((tag_id, tag_box));
            } else {
                outgoing
                    .entry(new_id.owner)
                    .or_default()
                    .entries
                    .push(RelationshipEntry {
                        new_seq: new_id.seq,
                        tag_id,
                        tag_box,
                    });
            }
        }
    }

    if !bidirectional {
        return Ok((tag_to_new, new_to_tag));
    }

    // Pass 2. Every holder of a remotely owned box sends exactly one
    // message (possibly empty) to that owner; every owner expects one
    // message from each other holder of its boxes.
    let mut targets = BTreeSet::new();
    let mut pending = BTreeSet::new();
    for (id, visible) in ctx.visible.iter() {
        if id.owner == ctx.rank {
            pending.extend(visible.holders.iter().copied().filter(|&r| r != ctx.rank));
        } else {
            targets.insert(id.owner);
        }
    }

    for dest in targets {
        let batch = outgoing.remove(&dest).unwrap_or_default();
        exchange.send(dest, RELATIONSHIP_TAG, batch.encode())?;
    }

    while !pending.is_empty() {
        let mut received = Vec::new();
        for &source in pending.iter() {
            let Some(msg) = exchange.try_recv(source, RELATIONSHIP_TAG)? else {
                continue;
            };
            let batch = RelationshipBatch::decode(ctx.dim, &msg).map_err(|_| {
                ClusterError::invariant(format!(
                    "malformed relationship message from rank {source}"
                ))
            })?;
            for entry in batch.entries {
                let new_id = BoxId {
                    owner: ctx.rank,
                    seq: entry.new_seq,
                };
                new_to_tag
                    .entry(new_id)
                    .or_default()
                    .insert((entry.tag_id, entry.tag_box));
            }
            received.push(source);
        }
        for source in received {
            pending.remove(&source);
        }
        exchange.progress()?;
    }

    Ok((tag_to_new, new_to_tag))
}
