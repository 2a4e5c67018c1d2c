use crate::region::RegionId;

/// A walkable span of a [`CompactHeightfield`](crate::CompactHeightfield), together with the links to its neighbors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactSpan {
    /// The floor of the span, in voxels above the bottom of the field.
    pub y: u16,
    /// The region of the span, [`RegionId::NONE`] until the field is partitioned.
    pub region: RegionId,
    /// Four 6-bit neighbor layers in the low 24 bits, the clearance in the high 8 bits.
    pub(crate) packed: u32,
}

impl CompactSpan {
    pub(crate) const NOT_CONNECTED: u8 = 0x3f;
    const CON_BITS: u32 = 6;
    const HEIGHT_SHIFT: u32 = 24;

    /// Links the span to the neighbor in `direction`, which sits at the given layer of its column.
    /// Passing `None` removes the link.
    pub fn set_con(&mut self, direction: u8, neighbor: impl Into<Option<u8>>) {
        let shift = direction as u32 * Self::CON_BITS;
        let mask = (Self::NOT_CONNECTED as u32) << shift;
        let layer = neighbor.into().unwrap_or(Self::NOT_CONNECTED).min(Self::NOT_CONNECTED);
        self.packed = (self.packed & !mask) | ((layer as u32) << shift);
    }

    /// The layer of the neighbor span in `direction` within its column, if the spans are linked.
    #[inline]
    pub fn con(&self, direction: u8) -> Option<u8> {
        let layer = (self.packed >> (direction as u32 * Self::CON_BITS)) as u8 & Self::NOT_CONNECTED;
        (layer != Self::NOT_CONNECTED).then_some(layer)
    }

    /// The free space above [`CompactSpan::y`], in voxels.
    #[inline]
    pub fn height(&self) -> u8 {
        (self.packed >> Self::HEIGHT_SHIFT) as u8
    }

    /// Sets the free space above the span.
    pub fn set_height(&mut self, height: u8) {
        let connections = self.packed & ((1 << Self::HEIGHT_SHIFT) - 1);
        self.packed = connections | ((height as u32) << Self::HEIGHT_SHIFT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn height_does_not_clobber_connections() {
        let mut span = CompactSpan::default();
        span.set_con(3, Some(7));
        span.set_height(10);
        assert_eq!(span.height(), 10);
        assert_eq!(span.con(3), Some(7));
    }

    #[test]
    fn connections_are_independent() {
        let mut span = CompactSpan::default();
        for dir in 0..4 {
            span.set_con(dir, None);
        }
        span.set_con(0, Some(1));
        span.set_con(2, Some(5));
        assert_eq!(span.con(0), Some(1));
        assert_eq!(span.con(1), None);
        assert_eq!(span.con(2), Some(5));
        assert_eq!(span.con(3), None);

        span.set_con(0, Some(2));
        span.set_con(2, None);
        assert_eq!(span.con(0), Some(2));
        assert_eq!(span.con(2), None);
    }
}
