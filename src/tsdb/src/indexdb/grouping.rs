use std::collections::HashMap;

use roaring::RoaringBitmap;

/// GroupingContext resolves, per candidate series, the tuple of tag value
/// IDs for a fixed list of tag keys. It is immutable after construction;
/// query execution shares it freely across threads.
pub struct GroupingContext {
    tag_key_ids: Vec<u32>,
    series_ids: RoaringBitmap,
    /// one scanner per tag key: (tag value id, series under that value)
    scanners: Vec<Vec<(u32, RoaringBitmap)>>,
}

impl GroupingContext {
    pub(crate) fn new(
        tag_key_ids: Vec<u32>,
        series_ids: RoaringBitmap,
        scanners: Vec<Vec<(u32, RoaringBitmap)>>,
    ) -> Self {
        Self {
            tag_key_ids,
            series_ids,
            scanners,
        }
    }

    pub fn tag_key_ids(&self) -> &[u32] {
        &self.tag_key_ids
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    /// tag_value_ids returns the series' value tuple, or None if the series
    /// misses any of the requested tag keys.
    pub fn tag_value_ids(&self, series_id: u32) -> Option<Vec<u32>> {
        let mut tuple = Vec::with_capacity(self.scanners.len());
        for scanner in &self.scanners {
            let value = scanner
                .iter()
                .find(|(_, bitmap)| bitmap.contains(series_id))
                .map(|(tag_value_id, _)| *tag_value_id)?;
            tuple.push(value);
        }
        Some(tuple)
    }

    /// build_groups partitions the candidate series by value tuple. Series
    /// missing one of the tag keys are left out.
    pub fn build_groups(&self) -> HashMap<Vec<u32>, RoaringBitmap> {
        let mut groups: HashMap<Vec<u32>, RoaringBitmap> = HashMap::new();
        for series_id in self.series_ids.iter() {
            if let Some(tuple) = self.tag_value_ids(series_id) {
                groups.entry(tuple).or_default().insert(series_id);
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap(ids: &[u32]) -> RoaringBitmap {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_tuple_lookup() {
        let ctx = GroupingContext::new(
            vec![10, 11],
            bitmap(&[1, 2, 3]),
            vec![
                vec![(100, bitmap(&[1, 3])), (101, bitmap(&[2]))],
                vec![(200, bitmap(&[1, 2]))],
            ],
        );

        assert_eq!(Some(vec![100, 200]), ctx.tag_value_ids(1));
        assert_eq!(Some(vec![101, 200]), ctx.tag_value_ids(2));
        // series 3 has no value under tag key 11
        assert_eq!(None, ctx.tag_value_ids(3));
    }

    #[test]
    fn test_build_groups() {
        let ctx = GroupingContext::new(
            vec![10],
            bitmap(&[1, 2, 3, 4]),
            vec![vec![(100, bitmap(&[1, 2])), (101, bitmap(&[3]))]],
        );

        let groups = ctx.build_groups();
        assert_eq!(2, groups.len());
        assert_eq!(bitmap(&[1, 2]), groups[&vec![100]]);
        assert_eq!(bitmap(&[3]), groups[&vec![101]]);
    }
}
