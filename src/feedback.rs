/*
    plume_advect - GPU particle advection through a 3D velocity field.
    Copyright (C) 2023  Ryan Andersen

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Two-slot owner of the particle buffers with alternating roles.
//!
//! Each frame hands out a [`Source`] (read as vertex attributes) and a [`Capture`]
//! (written by the kernel). The capture role holds the only mutable borrow of its
//! slot, so one buffer can never fill both roles in the same pass, and the roles
//! cannot be swapped while a pass still holds them.

/// The buffer read as attribute input for the current pass.
pub struct Source<'a, B> {
    buffer: &'a B,
    slot: usize,
}
impl<'a, B> Source<'a, B> {
    pub fn buffer(&self) -> &'a B {
        self.buffer
    }
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// The buffer the kernel writes its results into for the current pass.
pub struct Capture<'a, B> {
    buffer: &'a mut B,
    slot: usize,
}
impl<'a, B> Capture<'a, B> {
    pub fn buffer(&self) -> &B {
        self.buffer
    }
    pub fn into_buffer(self) -> &'a mut B {
        self.buffer
    }
    pub fn slot(&self) -> usize {
        self.slot
    }
}

pub struct FeedbackPair<B> {
    buffers: [B; 2],
    source: usize,
    frame: u64,
}

impl<B> FeedbackPair<B> {
    pub fn new(first: B, second: B) -> Self {
        Self {
            buffers: [first, second],
            source: 0,
            frame: 0,
        }
    }

    pub fn roles(&mut self) -> (Source<'_, B>, Capture<'_, B>) {
        let source = self.source;
        let capture = 1 - source;
        let (low, high) = self.buffers.split_at_mut(1);
        let (read, write) = if source == 0 {
            (&low[0], &mut high[0])
        } else {
            (&high[0], &mut low[0])
        };
        (
            Source {
                buffer: read,
                slot: source,
            },
            Capture {
                buffer: write,
                slot: capture,
            },
        )
    }

    // Called once the pass that captured into the current target has been submitted
    pub fn swap(&mut self) {
        self.source = 1 - self.source;
        self.frame += 1;
    }

    /// The buffer holding the most recent particle state (next frame's source).
    pub fn latest(&self) -> &B {
        &self.buffers[self.source]
    }

    /// Number of completed swaps.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[cfg(test)]
    pub fn buffers(&self) -> &[B; 2] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_never_alias_and_alternate() {
        let mut pair = FeedbackPair::new(vec![0u32; 4], vec![0u32; 4]);
        let mut previous_capture = None;

        for frame in 0..16u32 {
            let (source, capture) = pair.roles();
            assert_ne!(source.slot(), capture.slot());
            assert!(!std::ptr::eq(source.buffer(), capture.buffer()));

            // What was captured last frame is read this frame
            if let Some(previous) = previous_capture {
                assert_eq!(source.slot(), previous);
                assert!(source.buffer().iter().all(|&v| v == frame - 1));
            }
            previous_capture = Some(capture.slot());

            capture.into_buffer().fill(frame);
            pair.swap();
            assert_eq!(pair.frame(), u64::from(frame) + 1);
            assert!(pair.latest().iter().all(|&v| v == frame));
        }
    }

    #[test]
    fn starts_reading_the_first_slot() {
        let mut pair = FeedbackPair::new('a', 'b');
        assert_eq!(*pair.latest(), 'a');
        let (source, capture) = pair.roles();
        assert_eq!((*source.buffer(), *capture.buffer()), ('a', 'b'));
        pair.swap();
        assert_eq!(*pair.latest(), 'b');
        assert_eq!(pair.buffers(), &['a', 'b']);
    }
}
