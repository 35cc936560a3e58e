//! 近邻椭圆合并
//!
//! 两种策略:
//! - Pairwise: 逐个椭圆访问尚未访问过的无序对, 距离小于阈值的加入当前分组,
//!   每个分组保留面积最大者 (与现场部署行为一致, 不做传递闭包)
//! - Connected: 并查集求连通分量, 每个分量保留面积最大者

use crate::config::MergeStrategy;

use super::types::Ellipse;

pub fn merge_nearby(ellipses: &[Ellipse], distance: f32, strategy: MergeStrategy) -> Vec<Ellipse> {
    match strategy {
        MergeStrategy::Pairwise => merge_pairwise(ellipses, distance),
        MergeStrategy::Connected => merge_connected(ellipses, distance),
    }
}

/// 分组内面积最大者 (面积相同取先出现的)
fn largest(ellipses: &[Ellipse], group: &[usize]) -> usize {
    let mut best = group[0];
    for &idx in &group[1..] {
        if ellipses[idx].area() > ellipses[best].area() {
            best = idx;
        }
    }
    best
}

pub fn merge_pairwise(ellipses: &[Ellipse], distance: f32) -> Vec<Ellipse> {
    let n = ellipses.len();
    let mut done = vec![false; n * n];
    let mut skip = vec![false; n];
    let mut solved: Vec<usize> = Vec::new();

    for i in 0..n {
        let mut group: Vec<usize> = Vec::new();
        for j in 0..n {
            if i == j || done[i * n + j] {
                continue;
            }
            done[i * n + j] = true;
            done[j * n + i] = true;

            if ellipses[i].distance(&ellipses[j]) < distance {
                if !group.contains(&i) {
                    group.push(i);
                }
                if !group.contains(&j) {
                    group.push(j);
                }
                skip[i] = true;
                skip[j] = true;
            }
        }

        if !group.is_empty() {
            let best = largest(ellipses, &group);
            // 同一个椭圆可能代表多个分组, 只报告一次
            if !solved.contains(&best) {
                solved.push(best);
            }
        }
    }

    (0..n)
        .filter(|&idx| !skip[idx])
        .chain(solved)
        .map(|idx| ellipses[idx])
        .collect()
}

pub fn merge_connected(ellipses: &[Ellipse], distance: f32) -> Vec<Ellipse> {
    let n = ellipses.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut idx: usize) -> usize {
        while parent[idx] != idx {
            parent[idx] = parent[parent[idx]];
            idx = parent[idx];
        }
        idx
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if ellipses[i].distance(&ellipses[j]) < distance {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // 按首次出现顺序收集分量
    let mut components: Vec<(usize, Vec<usize>)> = Vec::new();
    for idx in 0..n {
        let root = find(&mut parent, idx);
        match components.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(idx),
            None => components.push((root, vec![idx])),
        }
    }

    let singles = components
        .iter()
        .filter(|(_, members)| members.len() == 1)
        .map(|(_, members)| members[0]);
    let merged = components
        .iter()
        .filter(|(_, members)| members.len() > 1)
        .map(|(_, members)| largest(ellipses, members));

    singles.chain(merged).map(|idx| ellipses[idx]).collect()
}
