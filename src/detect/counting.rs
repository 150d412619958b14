//! Multi-instance counting with overlap-aware deduplication.
//!
//! Template matching near a true location produces clusters of near-duplicate
//! peak responses. Counting therefore collects a template-sized box for every
//! accepted position and merges boxes that substantially overlap before
//! counting, so one physical object registers once.

use super::matcher;
use super::region::Region;
use super::template::{ProcessedImage, Template};

/// Boxes overlapping by at least this fraction of the smaller box are merged.
pub const DEFAULT_MERGE_RATIO: f32 = 0.5;

/// Merge rectangles whose mutual overlap reaches `merge_ratio` of the smaller
/// rectangle, returning one bounding rectangle per merged group.
pub fn group_overlapping(rects: &[Region], merge_ratio: f32) -> Vec<Region> {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], i: usize) -> usize {
        let mut root = i;
        while parent[root] != root {
            root = parent[root];
        }
        let mut i = i;
        while parent[i] != root {
            let next = parent[i];
            parent[i] = root;
            i = next;
        }
        root
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            let overlap = rects[i].intersection_area(&rects[j]);
            if overlap == 0 {
                continue;
            }
            let smaller = rects[i].area().min(rects[j].area());
            if overlap as f64 >= merge_ratio as f64 * smaller as f64 {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[ri] = rj;
                }
            }
        }
    }

    let mut groups: std::collections::HashMap<usize, Region> = std::collections::HashMap::new();
    for i in 0..rects.len() {
        let root = find(&mut parent, i);
        groups
            .entry(root)
            .and_modify(|bounds| *bounds = bounds.union_bounds(&rects[i]))
            .or_insert(rects[i]);
    }
    groups.into_values().collect()
}

/// Count distinct template instances across the whole region.
///
/// Scans every reference without early exit, turns each accepted position
/// into a template-sized box, merges overlapping boxes and counts the groups.
pub fn count_template_matches(
    screen: &ProcessedImage,
    templates: &[Template],
    threshold: f32,
    merge_ratio: f32,
) -> usize {
    let mut boxes: Vec<Region> = Vec::new();

    for template in templates {
        let (tw, th) = template.dimensions();
        for hit in matcher::hits_above(screen, template, threshold) {
            boxes.push(Region::new(hit.x, hit.y, tw, th));
        }
    }

    if boxes.is_empty() {
        return 0;
    }
    group_overlapping(&boxes, merge_ratio).len()
}
