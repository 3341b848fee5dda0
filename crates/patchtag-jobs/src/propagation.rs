//! Series linkage and propagation of tag recomputes.
//!
//! Aggregation is pull-based: a patch's aggregate reads its cover letter's
//! texts (and, under the bidirectional policy, a cover letter's aggregate
//! reads its patches' texts). The resolver answers two questions:
//!
//! - which submissions feed a submission's aggregate ([`PropagationResolver::sources_for`])
//! - which aggregates are stale after a change ([`PropagationResolver::targets`])

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use patchtag_core::defaults::MAX_REFERENCE_WALK;
use patchtag_core::{
    PropagationPolicy, Result, Series, SeriesId, Submission, SubmissionId, SubmissionKind,
    SubmissionSource, TextChange,
};

/// Resolves series membership and propagation targets.
#[derive(Clone)]
pub struct PropagationResolver {
    source: Arc<dyn SubmissionSource>,
    policy: PropagationPolicy,
}

impl PropagationResolver {
    pub fn new(source: Arc<dyn SubmissionSource>, policy: PropagationPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> PropagationPolicy {
        self.policy
    }

    /// Find the series a submission belongs to.
    ///
    /// An explicit link wins. Otherwise the submission's own message-id and
    /// its `In-Reply-To`/`References` are walked breadth-first: a message-id
    /// recorded as a series reference, or belonging to a submission already
    /// linked to a series, resolves the walk. Submissions found along the way
    /// contribute their own references, which tolerates out-of-order arrival.
    /// Each message-id is visited once and the walk stops after
    /// [`MAX_REFERENCE_WALK`] message-ids. `None` means a singleton.
    pub async fn resolve_series(&self, submission: &Submission) -> Result<Option<SeriesId>> {
        if let Some(series_id) = submission.series_id {
            return Ok(Some(series_id));
        }

        let project_id = submission.project_id;
        let mut queue: VecDeque<String> = std::iter::once(submission.msgid.as_str())
            .chain(submission.referenced_msgids())
            .map(str::to_string)
            .collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(msgid) = queue.pop_front() {
            if visited.contains(&msgid) {
                continue;
            }
            if visited.len() >= MAX_REFERENCE_WALK {
                warn!(
                    subsystem = "jobs",
                    component = "propagation",
                    op = "resolve_series",
                    submission_id = submission.id,
                    visited = visited.len(),
                    "Reference walk limit reached, treating as singleton"
                );
                return Ok(None);
            }
            visited.insert(msgid.clone());

            if let Some(series_id) = self.source.series_by_reference(project_id, &msgid).await? {
                trace!(
                    submission_id = submission.id,
                    series_id,
                    %msgid,
                    "Series found by reference"
                );
                return Ok(Some(series_id));
            }

            if msgid == submission.msgid {
                continue;
            }
            if let Some(ancestor) = self.source.submission_by_msgid(project_id, &msgid).await? {
                if let Some(series_id) = ancestor.series_id {
                    trace!(
                        submission_id = submission.id,
                        series_id,
                        ancestor_id = ancestor.id,
                        "Series found through ancestor"
                    );
                    return Ok(Some(series_id));
                }
                queue.extend(
                    ancestor
                        .referenced_msgids()
                        .filter(|m| !visited.contains(*m))
                        .map(str::to_string),
                );
            }
        }

        debug!(
            subsystem = "jobs",
            component = "propagation",
            op = "resolve_series",
            submission_id = submission.id,
            "No series found, treating as singleton"
        );
        Ok(None)
    }

    /// Members of a series, resolved the same way in both directions.
    ///
    /// Submissions linked to the series are members. So is every submission
    /// reachable backwards from the series' message-ids (its recorded
    /// references and the message-ids of members found so far) whose own
    /// [`resolve_series`](Self::resolve_series) lands on this series. A patch
    /// that arrived before its cover letter, and was never linked, is
    /// therefore found from the cover's side too. `None` if the series does
    /// not exist.
    pub async fn series_members(&self, series_id: SeriesId) -> Result<Option<SeriesMembers>> {
        let Some(series) = self.source.series(series_id).await? else {
            return Ok(None);
        };
        let project_id = series.project_id;

        let mut members: BTreeMap<SubmissionId, Submission> = BTreeMap::new();
        if let Some(cover_id) = series.cover_letter_id {
            if let Some(cover) = self.source.submission(cover_id).await? {
                members.insert(cover.id, cover);
            }
        }
        for patch in self.source.series_patches(series_id).await? {
            members.insert(patch.id, patch);
        }

        let mut queue: VecDeque<String> = self
            .source
            .series_reference_msgids(series_id)
            .await?
            .into_iter()
            .chain(members.values().map(|m| m.msgid.clone()))
            .collect();
        let mut checked: HashSet<SubmissionId> = members.keys().copied().collect();
        let mut visited: HashSet<String> = HashSet::new();

        while let Some(msgid) = queue.pop_front() {
            if visited.contains(&msgid) {
                continue;
            }
            if visited.len() >= MAX_REFERENCE_WALK {
                warn!(
                    subsystem = "jobs",
                    component = "propagation",
                    op = "series_members",
                    series_id,
                    visited = visited.len(),
                    "Reference walk limit reached, series membership truncated"
                );
                break;
            }
            visited.insert(msgid.clone());

            let mut candidates = self.source.submissions_referencing(project_id, &msgid).await?;
            candidates.extend(self.source.submission_by_msgid(project_id, &msgid).await?);
            for candidate in candidates {
                if !checked.insert(candidate.id) {
                    continue;
                }
                let belongs = match candidate.series_id {
                    Some(linked) => linked == series_id,
                    None => self.resolve_series(&candidate).await? == Some(series_id),
                };
                if belongs {
                    trace!(series_id, submission_id = candidate.id, "Unlinked series member found");
                    queue.push_back(candidate.msgid.clone());
                    members.insert(candidate.id, candidate);
                }
            }
        }

        let (covers, mut patches): (Vec<Submission>, Vec<Submission>) =
            members.into_values().partition(|m| m.is_cover_letter());
        patches.sort_by_key(|p| (p.number.unwrap_or(i32::MAX), p.id));
        let cover = match series.cover_letter_id {
            Some(id) => covers.into_iter().find(|c| c.id == id),
            None => covers.into_iter().next(),
        };

        Ok(Some(SeriesMembers {
            series,
            cover,
            patches,
        }))
    }

    async fn members_of(&self, submission: &Submission) -> Result<Option<SeriesMembers>> {
        match self.resolve_series(submission).await? {
            Some(series_id) => self.series_members(series_id).await,
            None => Ok(None),
        }
    }

    /// Submissions whose body and comments feed `submission`'s aggregate,
    /// in aggregation order. The submission itself always comes first.
    pub async fn sources_for(&self, submission: &Submission) -> Result<Vec<Submission>> {
        let mut sources = vec![submission.clone()];

        match submission.kind {
            SubmissionKind::Patch if self.policy.cover_flows_to_patches() => {
                let Some(members) = self.members_of(submission).await? else {
                    return Ok(sources);
                };
                log_series_state(submission.id, &members.series);
                sources.extend(members.cover.filter(|c| c.id != submission.id));
            }
            SubmissionKind::CoverLetter if self.policy.patches_flow_to_cover() => {
                let Some(members) = self.members_of(submission).await? else {
                    return Ok(sources);
                };
                sources.extend(members.patches.into_iter().filter(|p| p.id != submission.id));
            }
            _ => {}
        }

        Ok(sources)
    }

    /// Submissions whose aggregates must be recomputed after `change`.
    ///
    /// The owning submission always comes first. A submission that no longer
    /// exists yields itself, so that its rows are cleared, plus whatever its
    /// former series needs when the change names that series.
    pub async fn targets(&self, change: &TextChange) -> Result<Vec<SubmissionId>> {
        let submission_id = change.entity.submission_id();
        let mut targets = vec![submission_id];

        match self.source.submission(submission_id).await? {
            Some(submission) => match submission.kind {
                SubmissionKind::Patch
                    if self.policy.patches_flow_to_cover() && change.kind.changes_membership() =>
                {
                    if let Some(members) = self.members_of(&submission).await? {
                        targets.extend(members.cover.map(|c| c.id));
                    }
                }
                SubmissionKind::CoverLetter if self.policy.cover_flows_to_patches() => {
                    if let Some(members) = self.members_of(&submission).await? {
                        targets.extend(members.patches.iter().map(|p| p.id));
                    }
                }
                _ => {}
            },
            None => {
                if let Some(series_id) = change.series_id {
                    targets.extend(self.orphaned_targets(series_id).await?);
                }
            }
        }

        let mut seen = HashSet::new();
        targets.retain(|id| seen.insert(*id));

        debug!(
            subsystem = "jobs",
            component = "propagation",
            op = "targets",
            submission_id,
            policy = %self.policy,
            change = ?change.kind,
            targets = targets.len(),
            "Propagation targets resolved"
        );
        Ok(targets)
    }

    /// Targets in a series after one of its submissions was removed.
    ///
    /// A series left without a cover letter may have lost the cover its
    /// patches aggregated. A remaining cover letter may have lost a patch.
    async fn orphaned_targets(&self, series_id: SeriesId) -> Result<Vec<SubmissionId>> {
        let Some(members) = self.series_members(series_id).await? else {
            return Ok(Vec::new());
        };
        let mut targets = Vec::new();
        if self.policy.cover_flows_to_patches() && members.cover.is_none() {
            targets.extend(members.patches.iter().map(|p| p.id));
        }
        if self.policy.patches_flow_to_cover() {
            targets.extend(members.cover.map(|c| c.id));
        }
        Ok(targets)
    }
}

/// Resolved members of a series.
#[derive(Debug, Clone)]
pub struct SeriesMembers {
    pub series: Series,
    pub cover: Option<Submission>,
    /// Patches ordered by number, unnumbered last.
    pub patches: Vec<Submission>,
}

fn log_series_state(submission_id: SubmissionId, series: &Series) {
    if series.cover_expected && series.cover_letter_id.is_none() {
        debug!(
            submission_id,
            series_id = series.id,
            "Cover letter expected but not received yet"
        );
    }
    if !series.is_complete() {
        trace!(
            submission_id,
            series_id = series.id,
            missing = ?series.missing_numbers(),
            "Series incomplete"
        );
    }
}
