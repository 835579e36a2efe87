//! Small display helpers shared by `migrid_cli`'s progress rendering.

/// Collapses a list of `"<prefix><digits>"` labels into `"<prefix><ranges>"`
/// groups, combining consecutive runs as `start-end` and separating gaps
/// with commas, preserving each prefix's first-seen order.
///
/// `"host:sh0001"`, `"host:sh0002"`, `"host:sh0003"` collapse to
/// `"host:sh0001-0003"`; a lone `"host:sh0008"` appends `,0008`.
pub fn collapse_ranges(items: &[String]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<(u64, usize)>> = std::collections::HashMap::new();

    for item in items {
        let split_at = item
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i);
        let Some(split_at) = split_at else { continue };
        let (prefix, digits) = item.split_at(split_at);
        let Ok(n) = digits.parse::<u64>() else { continue };

        if !groups.contains_key(prefix) {
            order.push(prefix.to_string());
        }
        groups.entry(prefix.to_string()).or_default().push((n, digits.len()));
    }

    order
        .into_iter()
        .map(|prefix| {
            let nums = &groups[&prefix];
            let ranges = format_ranges(nums);
            format!("{prefix}{ranges}")
        })
        .collect()
}

fn format_ranges(nums: &[(u64, usize)]) -> String {
    let mut pieces = Vec::new();
    let mut i = 0;
    while i < nums.len() {
        let (start, width) = nums[i];
        let mut end = start;
        let mut j = i + 1;
        while j < nums.len() && nums[j].0 == end + 1 {
            end = nums[j].0;
            j += 1;
        }
        if end == start {
            pieces.push(format!("{start:0width$}"));
        } else {
            pieces.push(format!("{start:0width$}-{end:0width$}"));
        }
        i = j;
    }
    pieces.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_consecutive_runs_with_gaps() {
        let items: Vec<String> = [
            "host:sh0001",
            "host:sh0002",
            "host:sh0003",
            "host:sh0008",
            "host:sh0009",
            "other:01",
            "other:02",
            "other:03",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(
            collapse_ranges(&items),
            vec!["host:sh0001-0003,0008-0009".to_string(), "other:01-03".to_string()]
        );
    }

    #[test]
    fn non_consecutive_pair_stays_comma_separated() {
        let items: Vec<String> = ["host:sh0001", "host:sh0003"].into_iter().map(String::from).collect();
        assert_eq!(collapse_ranges(&items), vec!["host:sh0001,0003".to_string()]);
    }
}
