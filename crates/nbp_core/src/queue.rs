//! Fila de entrada entre produtores e o dispatcher.
//!
//! Multi-produtor / consumidor único sobre `crossbeam-channel`. Duas filas
//! internas: METADATA vai por uma faixa prioritária e é entregue antes de
//! UPDATE/ALL mais antigos; o resto segue FIFO.
//!
//! Quando a fila normal tem capacidade, o comportamento ao encher é
//! configurável via [`OverflowPolicy`].

use crate::types::{Envelope, NbpMessage};
use crossbeam_channel::{Receiver, RecvError, Sender, TrySendError, bounded, select, unbounded};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// O que fazer quando a fila normal está cheia.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Descarta o item mais antigo (telemetria prefere frescor)
    #[default]
    DropOldest,
    /// Recusa o item novo com [`QueueError::Full`]
    Reject,
    /// Bloqueia o produtor até haver espaço
    Block,
}

/// Erros de enfileiramento.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Fila cheia, item recusado")]
    Full,

    #[error("Dispatcher encerrado, fila fechada")]
    Closed,
}

/// Resultado de uma espera na fila.
#[derive(Debug)]
pub enum Recv {
    Item(Envelope),
    /// Prazo atingido sem itens
    Timeout,
    /// Sinal de cancelamento recebido
    Cancelled,
    /// Todos os produtores foram descartados e a fila está vazia
    Disconnected,
}

/// Cria a fila. `capacity = None` = sem limite.
pub fn channel(capacity: Option<usize>, overflow: OverflowPolicy) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = match capacity {
        Some(cap) => bounded(cap.max(1)),
        None => unbounded(),
    };
    let (priority_tx, priority_rx) = unbounded();
    let closed = Arc::new(AtomicBool::new(false));

    let producer = QueueProducer {
        tx,
        oldest: (overflow == OverflowPolicy::DropOldest).then(|| rx.clone()),
        priority_tx,
        overflow,
        closed: Arc::clone(&closed),
    };
    let consumer = QueueConsumer {
        rx,
        priority_rx,
        closed,
    };
    (producer, consumer)
}

// ──────────────────────────────────────────────
// Produtor
// ──────────────────────────────────────────────

/// Lado produtor. Clonável; cada thread produtora guarda o seu.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: Sender<Envelope>,
    /// Receiver usado apenas para descartar o item mais antigo
    oldest: Option<Receiver<Envelope>>,
    priority_tx: Sender<Envelope>,
    overflow: OverflowPolicy,
    closed: Arc<AtomicBool>,
}

impl QueueProducer {
    /// Enfileira com o timestamp atual.
    pub fn enqueue(&self, message: NbpMessage) -> Result<(), QueueError> {
        self.send(Envelope::now(message))
    }

    /// Enfileira com timestamp do produtor (segundos Unix).
    pub fn enqueue_at(&self, message: NbpMessage, timestamp: f64) -> Result<(), QueueError> {
        self.send(Envelope::new(message, timestamp))
    }

    pub fn send(&self, envelope: Envelope) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        if matches!(envelope.message, NbpMessage::Metadata(_)) {
            return self
                .priority_tx
                .send(envelope)
                .map_err(|_| QueueError::Closed);
        }

        match self.overflow {
            OverflowPolicy::Block => self.tx.send(envelope).map_err(|_| QueueError::Closed),
            OverflowPolicy::Reject => match self.tx.try_send(envelope) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    warn!("Fila cheia, item recusado");
                    Err(QueueError::Full)
                }
                Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
            },
            OverflowPolicy::DropOldest => {
                let mut envelope = envelope;
                loop {
                    match self.tx.try_send(envelope) {
                        Ok(()) => return Ok(()),
                        Err(TrySendError::Full(back)) => {
                            envelope = back;
                            if let Some(oldest) = &self.oldest {
                                if oldest.try_recv().is_ok() {
                                    debug!("Fila cheia, descartando item mais antigo");
                                }
                            }
                        }
                        Err(TrySendError::Disconnected(_)) => return Err(QueueError::Closed),
                    }
                }
            }
        }
    }

    /// Itens aguardando na fila normal.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty() && self.priority_tx.is_empty()
    }
}

// ──────────────────────────────────────────────
// Consumidor
// ──────────────────────────────────────────────

/// Lado consumidor. Pertence exclusivamente ao dispatcher.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: Receiver<Envelope>,
    priority_rx: Receiver<Envelope>,
    closed: Arc<AtomicBool>,
}

impl QueueConsumer {
    /// Próximo item sem bloquear, METADATA primeiro.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.priority_rx
            .try_recv()
            .or_else(|_| self.rx.try_recv())
            .ok()
    }

    /// Bloqueia até chegar um item, o prazo vencer (`None` = sem prazo) ou
    /// `cancel` sinalizar.
    pub fn recv_until(&self, deadline: Option<Instant>, cancel: &Receiver<()>) -> Recv {
        if let Some(envelope) = self.try_recv() {
            return Recv::Item(envelope);
        }

        let timer = match deadline {
            Some(at) => crossbeam_channel::at(at),
            None => crossbeam_channel::never(),
        };

        let received: Result<Envelope, RecvError> = select! {
            recv(self.priority_rx) -> msg => msg,
            recv(self.rx) -> msg => msg,
            recv(cancel) -> _ => return Recv::Cancelled,
            recv(timer) -> _ => return Recv::Timeout,
        };

        match received {
            Ok(envelope) => Recv::Item(envelope),
            // Uma das faixas desconectou: os produtores sumiram, mas ainda
            // pode haver itens na outra.
            Err(RecvError) => match self.try_recv() {
                Some(envelope) => Recv::Item(envelope),
                None => Recv::Disconnected,
            },
        }
    }

    /// Itens aguardando (ambas as faixas).
    pub fn len(&self) -> usize {
        self.rx.len() + self.priority_rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceMetadata, Kpi};
    use std::time::Duration;

    fn update(value: f64) -> NbpMessage {
        NbpMessage::Update(vec![Kpi::new("RPM", "RPM", value)])
    }

    fn rpm(envelope: &Envelope) -> f64 {
        match &envelope.message {
            NbpMessage::Update(kpis) | NbpMessage::All(kpis) => kpis[0].value(),
            NbpMessage::Metadata(_) => panic!("esperado KPI"),
        }
    }

    #[test]
    fn fifo_order() {
        let (tx, rx) = channel(None, OverflowPolicy::DropOldest);
        for v in [1.0, 2.0, 3.0] {
            tx.enqueue(update(v)).unwrap();
        }
        let values: Vec<f64> = std::iter::from_fn(|| rx.try_recv()).map(|e| rpm(&e)).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn metadata_jumps_the_queue() {
        let (tx, rx) = channel(None, OverflowPolicy::DropOldest);
        tx.enqueue(update(1.0)).unwrap();
        tx.enqueue(NbpMessage::Metadata(DeviceMetadata::new("Dash")))
            .unwrap();
        let first = rx.try_recv().unwrap();
        assert!(matches!(first.message, NbpMessage::Metadata(_)));
        assert_eq!(rpm(&rx.try_recv().unwrap()), 1.0);
    }

    #[test]
    fn drop_oldest_keeps_freshest() {
        let (tx, rx) = channel(Some(2), OverflowPolicy::DropOldest);
        for v in [1.0, 2.0, 3.0, 4.0] {
            tx.enqueue(update(v)).unwrap();
        }
        let values: Vec<f64> = std::iter::from_fn(|| rx.try_recv()).map(|e| rpm(&e)).collect();
        assert_eq!(values, vec![3.0, 4.0]);
    }

    #[test]
    fn reject_policy_refuses_when_full() {
        let (tx, rx) = channel(Some(1), OverflowPolicy::Reject);
        tx.enqueue(update(1.0)).unwrap();
        assert_eq!(tx.enqueue(update(2.0)), Err(QueueError::Full));
        assert_eq!(rpm(&rx.try_recv().unwrap()), 1.0);
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn metadata_is_never_rejected() {
        let (tx, rx) = channel(Some(1), OverflowPolicy::Reject);
        tx.enqueue(update(1.0)).unwrap();
        tx.enqueue(NbpMessage::Metadata(DeviceMetadata::default()))
            .unwrap();
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn block_policy_waits_for_room() {
        let (tx, rx) = channel(Some(1), OverflowPolicy::Block);
        tx.enqueue(update(1.0)).unwrap();

        let producer = tx.clone();
        let handle = std::thread::spawn(move || producer.enqueue(update(2.0)));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(rpm(&rx.try_recv().unwrap()), 1.0);
        handle.join().unwrap().unwrap();

        let (_cancel_tx, cancel) = crossbeam_channel::bounded::<()>(1);
        let deadline = Instant::now() + Duration::from_secs(1);
        match rx.recv_until(Some(deadline), &cancel) {
            Recv::Item(e) => assert_eq!(rpm(&e), 2.0),
            other => panic!("esperado item, obtido {other:?}"),
        }
    }

    #[test]
    fn enqueue_fails_after_consumer_drops() {
        let (tx, rx) = channel(Some(4), OverflowPolicy::DropOldest);
        drop(rx);
        assert_eq!(tx.enqueue(update(1.0)), Err(QueueError::Closed));
    }

    #[test]
    fn recv_times_out() {
        let (_tx, rx) = channel(None, OverflowPolicy::DropOldest);
        let cancel = crossbeam_channel::never();
        let start = Instant::now();
        let result = rx.recv_until(Some(start + Duration::from_millis(30)), &cancel);
        assert!(matches!(result, Recv::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn recv_reports_cancel() {
        let (_tx, rx) = channel(None, OverflowPolicy::DropOldest);
        let (cancel_tx, cancel) = crossbeam_channel::bounded(1);
        cancel_tx.send(()).unwrap();
        assert!(matches!(rx.recv_until(None, &cancel), Recv::Cancelled));
    }

    #[test]
    fn recv_drains_before_reporting_disconnect() {
        let (tx, rx) = channel(None, OverflowPolicy::DropOldest);
        tx.enqueue(update(7.0)).unwrap();
        drop(tx);
        let cancel = crossbeam_channel::never();
        assert!(matches!(rx.recv_until(None, &cancel), Recv::Item(_)));
        assert!(matches!(rx.recv_until(None, &cancel), Recv::Disconnected));
    }
}
