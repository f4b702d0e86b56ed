//! Guillotine rectangle packer over a fixed square.
//!
//! Nodes live in an arena and form a binary tree; every insert splits a free
//! leaf into the requested rectangle and the remainder. Freeing a leaf merges
//! it back with its sibling when both halves are empty.

/// Packed rectangle in texels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Identifier of an occupied leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RectId(usize);

#[derive(Debug)]
struct Node<T> {
    rect: Rect,
    parent: Option<usize>,
    children: Option<(usize, usize)>,
    data: Option<T>,
}

/// Guillotine packer storing `T` per occupied rectangle
#[derive(Debug)]
pub struct RectPack<T> {
    size: u32,
    nodes: Vec<Node<T>>,
    free_slots: Vec<usize>,
    used_area: u64,
}

impl<T> RectPack<T> {
    pub fn new(size: u32) -> Self {
        let mut pack = Self {
            size,
            nodes: Vec::new(),
            free_slots: Vec::new(),
            used_area: 0,
        };
        pack.clear();
        pack
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Remove every rectangle
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free_slots.clear();
        self.used_area = 0;
        self.nodes.push(Node {
            rect: Rect {
                x: 0,
                y: 0,
                width: self.size,
                height: self.size,
            },
            parent: None,
            children: None,
            data: None,
        });
    }

    /// Insert a `width`x`height` rectangle, returning `None` when nothing fits
    pub fn insert(&mut self, width: u32, height: u32, data: T) -> Option<RectId> {
        if width == 0 || height == 0 {
            return None;
        }
        let leaf = self.find_leaf(0, width, height)?;
        let target = self.split(leaf, width, height);
        self.nodes[target].data = Some(data);
        self.used_area += self.nodes[target].rect.area();
        Some(RectId(target))
    }

    /// Free a rectangle, returning its data
    pub fn free(&mut self, id: RectId) -> Option<T> {
        let node = self.nodes.get_mut(id.0)?;
        let data = node.data.take()?;
        self.used_area -= node.rect.area();

        let mut current = node.parent;
        while let Some(parent) = current {
            let Some((a, b)) = self.nodes[parent].children else {
                break;
            };
            if !self.is_empty_leaf(a) || !self.is_empty_leaf(b) {
                break;
            }
            self.nodes[parent].children = None;
            self.free_slots.push(a);
            self.free_slots.push(b);
            current = self.nodes[parent].parent;
        }
        Some(data)
    }

    pub fn rect(&self, id: RectId) -> Option<Rect> {
        self.nodes
            .get(id.0)
            .filter(|n| n.data.is_some())
            .map(|n| n.rect)
    }

    pub fn get(&self, id: RectId) -> Option<&T> {
        self.nodes.get(id.0).and_then(|n| n.data.as_ref())
    }

    pub fn get_mut(&mut self, id: RectId) -> Option<&mut T> {
        self.nodes.get_mut(id.0).and_then(|n| n.data.as_mut())
    }

    /// Occupied texels
    pub fn used_area(&self) -> u64 {
        self.used_area
    }

    /// Fraction of the square covered by rectangles
    pub fn usage(&self) -> f32 {
        self.used_area as f32 / (self.size as f32 * self.size as f32)
    }

    fn is_empty_leaf(&self, index: usize) -> bool {
        let node = &self.nodes[index];
        node.children.is_none() && node.data.is_none()
    }

    fn find_leaf(&self, root: usize, width: u32, height: u32) -> Option<usize> {
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if node.rect.width < width || node.rect.height < height {
                continue;
            }
            match node.children {
                Some((a, b)) => {
                    stack.push(b);
                    stack.push(a);
                }
                None if node.data.is_none() => return Some(index),
                None => {}
            }
        }
        None
    }

    /// Split a free leaf so its first descendant is exactly `width`x`height`
    fn split(&mut self, leaf: usize, width: u32, height: u32) -> usize {
        let rect = self.nodes[leaf].rect;
        if rect.width == width && rect.height == height {
            return leaf;
        }

        let dw = rect.width - width;
        let dh = rect.height - height;
        let (first, second) = if dw > dh {
            (
                Rect { width, ..rect },
                Rect {
                    x: rect.x + width,
                    width: dw,
                    ..rect
                },
            )
        } else {
            (
                Rect { height, ..rect },
                Rect {
                    y: rect.y + height,
                    height: dh,
                    ..rect
                },
            )
        };

        let a = self.alloc_node(first, leaf);
        let b = self.alloc_node(second, leaf);
        self.nodes[leaf].children = Some((a, b));
        self.split(a, width, height)
    }

    fn alloc_node(&mut self, rect: Rect, parent: usize) -> usize {
        let node = Node {
            rect,
            parent: Some(parent),
            children: None,
            data: None,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlaps(a: Rect, b: Rect) -> bool {
        a.x < b.x + b.width && b.x < a.x + a.width && a.y < b.y + b.height && b.y < a.y + a.height
    }

    #[test]
    fn test_insert_exact_fit() {
        let mut pack = RectPack::new(64);
        let id = pack.insert(64, 64, 'a').unwrap();
        assert_eq!(
            pack.rect(id),
            Some(Rect {
                x: 0,
                y: 0,
                width: 64,
                height: 64
            })
        );
        assert!(pack.insert(8, 8, 'b').is_none());
        assert_eq!(pack.usage(), 1.0);
    }

    #[test]
    fn test_rects_never_overlap() {
        let mut pack = RectPack::new(256);
        let mut rects = Vec::new();
        for (i, size) in [64, 32, 128, 16, 48, 8, 64, 32].iter().enumerate() {
            let id = pack.insert(*size, *size, i).unwrap();
            rects.push(pack.rect(id).unwrap());
        }
        for (i, a) in rects.iter().enumerate() {
            assert!(a.x + a.width <= 256 && a.y + a.height <= 256);
            for b in &rects[i + 1..] {
                assert!(!overlaps(*a, *b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_free_merges_space() {
        let mut pack = RectPack::new(128);
        let ids: Vec<_> = (0..4).map(|i| pack.insert(64, 64, i).unwrap()).collect();
        assert!(pack.insert(64, 64, 99).is_none());

        for id in ids {
            assert!(pack.free(id).is_some());
        }
        assert_eq!(pack.used_area(), 0);
        assert!(pack.insert(128, 128, 7).is_some());
    }

    #[test]
    fn test_double_free_returns_none() {
        let mut pack = RectPack::new(32);
        let id = pack.insert(8, 8, ()).unwrap();
        assert!(pack.free(id).is_some());
        assert!(pack.free(id).is_none());
    }
}
