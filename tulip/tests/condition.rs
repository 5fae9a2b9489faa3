use tulip::sync::Condition;
use tulip::{Error, Handle};

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

#[tulip::test]
async fn test_condition_requires_lock(handle: Handle) {
    let cond = Condition::new(&handle);

    assert!(matches!(cond.wait(None).await, Err(Error::IllegalState(_))));
    assert!(matches!(
        cond.wait_for(|| true, None).await,
        Ok(true)
    ));
    assert!(matches!(cond.notify(1), Err(Error::IllegalState(_))));
}

#[tulip::test]
async fn test_condition_wait_releases_then_reacquires(handle: Handle) {
    let cond = Rc::new(Condition::new(&handle));

    let waiter = handle.spawn({
        let cond = cond.clone();
        async move {
            assert!(cond.acquire(None).await);
            let notified = cond.wait(None).await.unwrap();
            let held = cond.locked();
            cond.release().unwrap();
            (notified, held)
        }
    });

    handle.sleep(Duration::from_millis(1)).await.unwrap();

    // The waiter released the lock while parked.
    assert!(cond.acquire(Some(Duration::ZERO)).await);
    cond.notify(1).unwrap();
    assert!(!waiter.done());

    cond.release().unwrap();
    assert_eq!(waiter.await.unwrap(), (true, true));
}

#[tulip::test]
async fn test_condition_timed_out_wait_reacquires(handle: Handle) {
    let cond = Rc::new(Condition::new(&handle));

    let waiter = handle.spawn({
        let cond = cond.clone();
        async move {
            assert!(cond.acquire(None).await);
            let notified = cond.wait(Some(Duration::from_millis(2))).await.unwrap();
            let held = cond.locked();
            cond.release().unwrap();
            (notified, held)
        }
    });

    handle.sleep(Duration::from_millis(1)).await.unwrap();
    assert!(cond.acquire(None).await);

    // Timed out, but still blocked on reacquiring.
    handle.sleep(Duration::from_millis(10)).await.unwrap();
    assert!(!waiter.done());

    cond.release().unwrap();
    assert_eq!(waiter.await.unwrap(), (false, true));
}

#[tulip::test]
async fn test_condition_notify_wakes_in_order(handle: Handle) {
    let cond = Rc::new(Condition::new(&handle));
    let order = Rc::new(RefCell::new(Vec::new()));

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let cond = cond.clone();
            let order = order.clone();
            handle.spawn(async move {
                assert!(cond.acquire(None).await);
                assert!(cond.wait(None).await.unwrap());
                order.borrow_mut().push(i);
                cond.release().unwrap();
            })
        })
        .collect();

    handle.sleep(Duration::from_millis(1)).await.unwrap();

    for expected in 0..2 {
        assert!(cond.acquire(None).await);
        cond.notify(1).unwrap();
        cond.release().unwrap();

        handle.sleep(Duration::from_millis(1)).await.unwrap();
        assert_eq!(order.borrow().last(), Some(&expected));
    }

    assert!(cond.acquire(None).await);
    cond.notify_all().unwrap();
    cond.release().unwrap();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[tulip::test]
async fn test_condition_wait_for_predicate(handle: Handle) {
    let cond = Rc::new(Condition::new(&handle));
    let ready = Rc::new(Cell::new(false));

    let consumer = handle.spawn({
        let cond = cond.clone();
        let ready = ready.clone();
        async move {
            assert!(cond.acquire(None).await);
            let outcome = cond
                .wait_for(|| ready.get(), Some(Duration::from_secs(5)))
                .await
                .unwrap();
            cond.release().unwrap();
            outcome
        }
    });

    handle.sleep(Duration::from_millis(1)).await.unwrap();

    // A notification without the predicate holding keeps the consumer waiting.
    assert!(cond.acquire(None).await);
    cond.notify_all().unwrap();
    cond.release().unwrap();
    handle.sleep(Duration::from_millis(1)).await.unwrap();
    assert!(!consumer.done());

    assert!(cond.acquire(None).await);
    ready.set(true);
    cond.notify_all().unwrap();
    cond.release().unwrap();

    assert!(consumer.await.unwrap());
}
