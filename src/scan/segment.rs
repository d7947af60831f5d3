//! Per-job bundle walk.

use std::collections::BTreeSet;

use tracing::debug;

use crate::aggregator::JobLogger;
use crate::block::{Block, BlockFilters};
use crate::codec::SegmentReader;
use crate::linkage::{Linkage, LinkageTracker};
use crate::range::{parse_bundle_base, pretty_block_num, round_to_bundle_end, round_to_bundle_start, walk_prefix, BlockRange};
use crate::store::{cancellable, StoreError};

use super::{JobReport, PrintDetails, ScanContext, ScanError, ScanJob};

/// Walk the bundles of `job.range`, reporting holes and linkage issues to
/// `log`.  The job's completion marker is always sent, even on error.
pub async fn check_bundles(ctx: &ScanContext, job: &ScanJob, log: &JobLogger) -> Result<JobReport, ScanError> {
    let res = walk_bundles(ctx, job, log).await;
    log.done().await;
    res
}

async fn walk_bundles(ctx: &ScanContext, job: &ScanJob, log: &JobLogger) -> Result<JobReport, ScanError> {
    log.log(format!("Checking block holes on {}\n", ctx.store_label)).await;

    let size  = ctx.chain.bundle_size;
    let first = ctx.chain.first_streamable_block;

    let mut range = job.range;
    if range.start < first {
        range.start = first;
    }
    if range.is_bounded() && range.start > range.stop {
        return Err(ScanError::InvalidRange { start: range.start, stop: range.stop });
    }

    let mut report = JobReport::new(job.job_id, range);
    let mut expected      = round_to_bundle_start(range.start, size);
    let mut current_start = range.start;
    let mut seen_filters  = BTreeSet::new();
    let mut linkage       = LinkageTracker::default();

    let prefix = walk_prefix(&range, size);
    debug!(job_id = job.job_id, block_range = %range, walk_prefix = %prefix, "walking bundles");
    let keys = cancellable(&ctx.cancel, ctx.store.list(&prefix)).await?;

    for key in keys {
        if ctx.cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        let Some(base) = parse_bundle_base(&key) else { continue };
        debug!(job_id = job.job_id, key = %key, "received bundle");

        let bundle_end = base.saturating_add(size - 1);
        if bundle_end < range.start {
            debug!(base, starting_at = range.start, "bundle ends before range start, skipping");
            continue;
        }

        if base < expected {
            let overlap = BlockRange::new(base, bundle_end);
            log.log(format!("🔶 Segment {key} overlaps already walked range {overlap} (duplicate bundle)\n")).await;
            report.duplicates.push(base);
            continue;
        }
        report.bundles_seen += 1;

        if base != expected {
            // Nothing walked since the first bundle or the last progress line.
            if report.bundles_seen > 1 && current_start < expected {
                let ok = BlockRange::new(current_start, expected - 1);
                log.log(format!("✅ Range {ok}\n")).await;
            }
            let missing = BlockRange::new(expected, base - 1);
            log.log(format!("❌ Range {missing}! (Missing, [{}])\n", missing.reproc_range())).await;
            report.missing.push(missing);
            report.hole_found = true;
            current_start = base;
        }
        expected = base.saturating_add(size);

        if ctx.options.print_details != PrintDetails::Nothing {
            let seg = validate_segment(ctx, &key, base, &range, &mut linkage, log).await;
            seen_filters.extend(seg.filters);
            merge_min(&mut report.lowest_block_seen, seg.lowest);
            merge_max(&mut report.highest_block_seen, seg.highest);
            if seg.read_failed {
                report.unreadable.push(key.clone());
            }
            if seg.short {
                report.short_segments.push(key.clone());
            }
        } else {
            merge_min(&mut report.lowest_block_seen, Some(base));
            merge_max(&mut report.highest_block_seen, Some(expected));
        }

        if report.bundles_seen % ctx.options.progress_interval.max(1) == 0 {
            let ok = BlockRange::new(current_start, round_to_bundle_end(base, size));
            log.log(format!("✅ Range {ok}\n")).await;
            current_start = expected;
        }

        if range.is_bounded() && round_to_bundle_end(base, size) >= range.stop - 1 {
            break;
        }
    }

    debug!(
        job_id = job.job_id,
        range = %range,
        lowest_block_seen = ?report.lowest_block_seen,
        highest_block_seen = ?report.highest_block_seen,
        "checking incomplete range"
    );

    let lowest  = report.lowest_block_seen.unwrap_or(u64::MAX);
    let highest = report.highest_block_seen.unwrap_or(0);
    if range.is_bounded()
        && (highest < range.stop - 1 || (lowest > range.start && lowest > first))
    {
        report.incomplete = true;
        log.log(format!(
            "🔶 Incomplete range {range}, started at block {} and stopped at block: {}\n",
            display_seen(report.lowest_block_seen),
            display_seen(report.highest_block_seen),
        ))
        .await;
    }

    report.last_linked = linkage.last_linked().cloned();
    let walked = BlockRange::new(current_start, highest);
    match &report.last_linked {
        Some(last) if last.number < highest => {
            report.fork_issue = true;
            log.log(format!(
                "🔶 Range {walked} has issues with forks, last linkable block number: {}\n",
                last.number
            ))
            .await;
        }
        _ => log.log(format!("✅ Range {walked}\n")).await,
    }

    if !seen_filters.is_empty() {
        let mut msg = String::from("\nSeen filters\n");
        for f in &seen_filters {
            msg.push_str(&format!("- [Include {:?}, Exclude {:?}, System {:?}]\n", f.include, f.exclude, f.system));
        }
        msg.push('\n');
        log.log(msg).await;
    }
    report.seen_filters = seen_filters.into_iter().collect();

    if report.hole_found {
        log.log("🆘 Holes found!\n").await;
    } else {
        log.log("🆗 No hole found\n").await;
    }
    Ok(report)
}

// ── Segment replay ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SegmentStats {
    lowest:      Option<u64>,
    highest:     Option<u64>,
    filters:     Vec<BlockFilters>,
    read_failed: bool,
    short:       bool,
}

/// Open one bundle and replay its blocks through `linkage`.  Read failures
/// are reported to the job log; the walk carries on with the next bundle.
async fn validate_segment(
    ctx:     &ScanContext,
    key:     &str,
    base:    u64,
    range:   &BlockRange,
    linkage: &mut LinkageTracker,
    log:     &JobLogger,
) -> SegmentStats {
    let mut stats = SegmentStats::default();

    let data = match cancellable(&ctx.cancel, ctx.store.open(key)).await {
        Ok(data) => data,
        Err(StoreError::Cancelled) => return stats,
        Err(e) => {
            log.log(format!("❌ Unable to read blocks segment {key}: {e}\n")).await;
            stats.read_failed = true;
            return stats;
        }
    };
    let mut reader = match SegmentReader::new(&data[..]) {
        Ok(reader) => reader,
        Err(e) => {
            log.log(format!("❌ Unable to read blocks segment {key}: {e}\n")).await;
            stats.read_failed = true;
            return stats;
        }
    };

    let details = ctx.options.print_details;
    let mut seen_block_count = 0u64;
    loop {
        match reader.read() {
            Ok(Some(block)) => {
                seen_block_count += 1;
                if range.is_bounded() {
                    if block.number >= range.stop {
                        return stats;
                    }
                    if block.number < range.start {
                        continue;
                    }
                }
                merge_min(&mut stats.lowest, Some(block.number));
                merge_max(&mut stats.highest, Some(block.number));

                if let Linkage::Unlinkable { large_gap, .. } = linkage.observe(&block) {
                    log.log(format!("🔶 Block #{} is not linkable at this point\n", block.number)).await;
                    if let Some(gap) = large_gap {
                        let last = gap
                            .last_linked
                            .map(|b| b.number.to_string())
                            .unwrap_or_else(|| "none".to_string());
                        log.log(format!(
                            "❌ Large gap of {} unlinkable blocks found in chain. Last linked block: {}, first Unlinkable block: {}. \n",
                            gap.count, last, gap.first_unlinkable.number
                        ))
                        .await;
                    }
                }
                if let Some(filters) = &block.filters {
                    stats.filters.push(filters.clone());
                }

                match details {
                    PrintDetails::Stats => log.log(block_summary(&block)).await,
                    PrintDetails::Full => match serde_json::to_string_pretty(&block) {
                        Ok(json) => log.log(json + "\n").await,
                        Err(e) => log.log(format!("❌ Unable to print full block {block}: {e}\n")).await,
                    },
                    PrintDetails::Nothing => {}
                }
            }
            Ok(None) => {
                let expected_count = ctx.chain.expected_block_count(base);
                if seen_block_count < expected_count && details >= ctx.options.short_segment_detail {
                    stats.short = true;
                    log.log(format!(
                        "🔶 Segment {key} contained only {seen_block_count} blocks (< {expected_count}), this can happen on some chains\n"
                    ))
                    .await;
                }
                return stats;
            }
            Err(e) => {
                log.log(format!(
                    "❌ Unable to read all blocks from segment {key} after reading {seen_block_count} blocks: {e}\n"
                ))
                .await;
                stats.read_failed = true;
                return stats;
            }
        }
    }
}

fn block_summary(block: &Block) -> String {
    format!(
        "Block #{} ({}) parent {} lib #{} at {}, {} bytes\n",
        block.number,
        block.id,
        block.parent_id,
        block.lib_num,
        block.timestamp.to_rfc3339(),
        block.payload.len(),
    )
}

fn display_seen(v: Option<u64>) -> String {
    v.map(pretty_block_num).unwrap_or_else(|| "none".to_string())
}

fn merge_min(acc: &mut Option<u64>, v: Option<u64>) {
    if let Some(v) = v {
        *acc = Some(acc.map_or(v, |a| a.min(v)));
    }
}

fn merge_max(acc: &mut Option<u64>, v: Option<u64>) {
    if let Some(v) = v {
        *acc = Some(acc.map_or(v, |a| a.max(v)));
    }
}
