//! LIFO accumulators shared by the processor and the translators.

use crate::error::TranslationError;

#[derive(Debug, Clone)]
pub struct Stack<T> {
    items: Vec<T>,
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Result<T, TranslationError> {
        self.items
            .pop()
            .ok_or_else(|| TranslationError::MalformedQuery("pop on empty stack".to_string()))
    }

    /// Pops `n` items and returns them in push order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<T>, TranslationError> {
        if n > self.items.len() {
            return Err(TranslationError::MalformedQuery(format!(
                "expected {} items on stack, found {}",
                n,
                self.items.len()
            )));
        }
        let at = self.items.len() - n;
        Ok(self.items.split_off(at))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// A stack of operand frames. Entering a call pushes a frame, visited
/// operands are appended to the top frame, leaving the call pops it.
#[derive(Debug, Clone)]
pub struct OperandStack<T> {
    frames: Vec<Vec<T>>,
}

impl<T> Default for OperandStack<T> {
    fn default() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<T> OperandStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Vec::new());
    }

    pub fn push_frame_with(&mut self, first: T) {
        self.frames.push(vec![first]);
    }

    pub fn append_to_top(&mut self, item: T) -> Result<(), TranslationError> {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.push(item);
                Ok(())
            }
            None => Err(TranslationError::MalformedQuery(
                "operand outside of a call".to_string(),
            )),
        }
    }

    pub fn pop_frame(&mut self) -> Result<Vec<T>, TranslationError> {
        self.frames
            .pop()
            .ok_or_else(|| TranslationError::MalformedQuery("no open call frame".to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_lifo() {
        let mut stack = Stack::new();
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.pop().unwrap(), 2);
        assert_eq!(stack.pop().unwrap(), 1);
        assert!(stack.pop().is_err());
    }

    #[test]
    fn test_pop_n_keeps_push_order() {
        let mut stack = Stack::new();
        for i in 0..4 {
            stack.push(i);
        }
        assert_eq!(stack.pop_n(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(stack.len(), 1);
        assert!(stack.pop_n(2).is_err());
        assert_eq!(stack.pop_n(0).unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn test_operand_frames() {
        let mut operands = OperandStack::new();
        assert!(operands.append_to_top("x").is_err());

        operands.push_frame_with("eq");
        operands.push_frame();
        operands.append_to_top("a").unwrap();
        operands.append_to_top("b").unwrap();
        assert_eq!(operands.pop_frame().unwrap(), vec!["a", "b"]);
        operands.append_to_top("c").unwrap();
        assert_eq!(operands.pop_frame().unwrap(), vec!["eq", "c"]);
        assert!(operands.is_empty());
        assert!(operands.pop_frame().is_err());
    }
}
