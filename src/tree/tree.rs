use std::collections::BTreeMap;

use crate::math::special::TIME_TOLERANCE;

// ─────────────────────────────────────────────────────────────────────────────
// TreeNode
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct TreeNode {
    label: Option<String>,
    branch_length: f64,
    height: f64,
    parent: Option<usize>,
    children: Vec<usize>,
    metadata: BTreeMap<String, String>,
}

impl TreeNode {
    pub fn new(label: Option<String>, branch_length: f64, metadata: BTreeMap<String, String>) -> TreeNode {
        TreeNode {
            label,
            branch_length,
            metadata,
            ..TreeNode::default()
        }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn branch_length(&self) -> f64 {
        self.branch_length
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NodeKind
// ─────────────────────────────────────────────────────────────────────────────

/// likelihood traversal 看到的節點型態。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// 一般取樣的 tip。
    Leaf,
    /// 長度為 0 的懸掛 leaf，代表其 parent 為 sampled ancestor。
    DirectAncestorLeaf,
    /// 取樣後仍延續的祖先：`child` 為延續的 lineage，`sample` 為帶 type 的節點
    ///（單子節點時即自身，否則為長度 0 的懸掛 leaf）。
    SampledAncestor { child: usize, sample: usize },
    Bifurcation { left: usize, right: usize },
}

// ─────────────────────────────────────────────────────────────────────────────
// Tree
// ─────────────────────────────────────────────────────────────────────────────

/// 以 `Vec` 存放節點、以 index 互相參照的有根樹。
#[derive(Clone, Debug)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: usize,
}

impl Tree {
    /// `nodes[i].children` 必須已設定；parent 與 height 由此推得。
    pub fn from_nodes(mut nodes: Vec<TreeNode>, root: usize) -> Tree {
        for index in 0..nodes.len() {
            let children = nodes[index].children.clone();
            for child in children {
                nodes[child].parent = Some(index);
            }
        }

        let mut depths = vec![0.0; nodes.len()];
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            for &child in &nodes[index].children {
                depths[child] = depths[index] + nodes[child].branch_length;
                stack.push(child);
            }
        }
        let max_depth = depths.iter().copied().fold(0.0, f64::max);
        for (node, depth) in nodes.iter_mut().zip(depths) {
            node.height = max_depth - depth;
        }

        Tree { nodes, root }
    }

    pub(crate) fn add_child(nodes: &mut [TreeNode], parent: usize, child: usize) {
        nodes[parent].children.push(child);
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn children(&self, index: usize) -> &[usize] {
        &self.nodes[index].children
    }

    pub fn height(&self, index: usize) -> f64 {
        self.nodes[index].height
    }

    pub fn is_leaf(&self, index: usize) -> bool {
        self.nodes[index].is_leaf()
    }

    /// 與 parent 同高的 leaf。
    pub fn is_direct_ancestor(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.is_leaf()
            && node
                .parent
                .is_some_and(|parent| (self.nodes[parent].height - node.height).abs() <= TIME_TOLERANCE)
    }

    pub fn kind(&self, index: usize) -> NodeKind {
        match self.nodes[index].children.as_slice() {
            [] if self.is_direct_ancestor(index) => NodeKind::DirectAncestorLeaf,
            [] => NodeKind::Leaf,
            [child] => NodeKind::SampledAncestor { child: *child, sample: index },
            [left, right] if self.is_direct_ancestor(*left) => NodeKind::SampledAncestor { child: *right, sample: *left },
            [left, right] if self.is_direct_ancestor(*right) => NodeKind::SampledAncestor { child: *left, sample: *right },
            [left, right, ..] => NodeKind::Bifurcation { left: *left, right: *right },
        }
    }

    pub fn is_binary(&self) -> bool {
        self.nodes.iter().all(|node| node.children.len() <= 2)
    }

    /// leaf 數，包含代表 sampled ancestor 的長度 0 leaf。
    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.is_leaf()).count()
    }

    pub fn direct_ancestor_count(&self) -> usize {
        (0..self.nodes.len()).filter(|i| self.is_direct_ancestor(*i)).count()
    }

    /// 所有取樣事件：leaf 加上單子節點形式的 sampled ancestor。
    pub fn sample_count(&self) -> usize {
        self.leaf_count() + self.nodes.iter().filter(|node| node.children.len() == 1).count()
    }

    pub fn bifurcation_count(&self) -> usize {
        (0..self.nodes.len())
            .filter(|i| matches!(self.kind(*i), NodeKind::Bifurcation { .. }))
            .count()
    }

    pub fn post_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(self.root, false)];
        while let Some((index, expanded)) = stack.pop() {
            if expanded {
                order.push(index);
            } else {
                stack.push((index, true));
                for &child in self.nodes[index].children.iter().rev() {
                    stack.push((child, false));
                }
            }
        }
        order
    }

    /// 每個節點為根的 subtree 節點數。
    pub fn subtree_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![1; self.nodes.len()];
        for index in self.post_order() {
            sizes[index] += self.nodes[index].children.iter().map(|c| sizes[*c]).sum::<usize>();
        }
        sizes
    }

    /// 交換 `index` 的前兩個子節點。
    pub fn rotate(&mut self, index: usize) {
        if self.nodes[index].children.len() >= 2 {
            self.nodes[index].children.swap(0, 1);
        }
    }
}
