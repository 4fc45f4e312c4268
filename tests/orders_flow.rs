use sea_orm::ActiveValue::NotSet;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use storefront_api::{
    db::{create_orm_conn, create_pool, run_migrations},
    dto::cart::AddToCartRequest,
    dto::orders::{PlaceOrderRequest, ShippingAddress, UpdateOrderStatusRequest},
    entity::{
        cart_items::ActiveModel as CartItemActive,
        products::{ActiveModel as ProductActive, Entity as Products},
        users::ActiveModel as UserActive,
    },
    error::AppError,
    middleware::auth::AuthUser,
    routes::params::{OrderListQuery, Pagination},
    services::{cart_service, order_service},
    state::AppState,
};

// Integration flows against a real Postgres; they skip when no database is
// configured. Each test seeds its own users and products so they can run in
// parallel against a shared database.

fn database_url() -> Option<String> {
    std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()
}

async fn setup_state(database_url: &str) -> anyhow::Result<AppState> {
    let pool = create_pool(database_url, 5).await?;
    let orm = create_orm_conn(database_url).await?;
    run_migrations(&orm).await?;
    Ok(AppState { pool, orm })
}

async fn create_user(state: &AppState, role: &str) -> anyhow::Result<AuthUser> {
    let user = UserActive {
        id: Set(Uuid::new_v4()),
        email: Set(format!("{}+{}@example.com", role, Uuid::new_v4())),
        password_hash: Set("dummy".into()),
        name: Set(format!("{role} tester")),
        role: Set(role.into()),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(AuthUser {
        user_id: user.id,
        role: user.role,
    })
}

async fn create_product(
    state: &AppState,
    name: &str,
    price: i64,
    stock: i32,
) -> anyhow::Result<Uuid> {
    let product = ProductActive {
        id: Set(Uuid::new_v4()),
        name: Set(format!("{} {}", name, Uuid::new_v4())),
        description: Set(Some("A product for testing".into())),
        price: Set(price),
        image: Set(None),
        category_id: Set(None),
        stock: Set(stock),
        sold_count: Set(0),
        is_new: Set(false),
        is_featured: Set(false),
        is_active: Set(true),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    Ok(product.id)
}

async fn product_counts(state: &AppState, id: Uuid) -> anyhow::Result<(i32, i32)> {
    let product = Products::find_by_id(id)
        .one(&state.orm)
        .await?
        .expect("product exists");
    Ok((product.stock, product.sold_count))
}

fn shipping() -> PlaceOrderRequest {
    PlaceOrderRequest {
        shipping_address: ShippingAddress {
            name: "Ada Tester".into(),
            phone: "555-0100".into(),
            address: "1 Example Road".into(),
            city: "Springfield".into(),
            province: "East".into(),
            zip_code: Some("10001".into()),
        },
        remark: None,
    }
}

fn empty_pagination() -> Pagination {
    Pagination {
        page: None,
        per_page: None,
    }
}

#[tokio::test]
async fn checkout_decrements_stock_and_clears_cart() -> anyhow::Result<()> {
    let Some(url) = database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run it.");
        return Ok(());
    };
    let state = setup_state(&url).await?;

    let user = create_user(&state, "user").await?;
    let product_id = create_product(&state, "Widget", 100, 3).await?;

    cart_service::add_to_cart(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;

    let resp = order_service::place_order(&state, &user, shipping()).await?;
    let placed = resp.data.unwrap();
    assert_eq!(placed.order.total_amount, 200);
    assert_eq!(placed.order.status, "pending");
    assert!(placed.order.order_no.starts_with("ORD"));
    assert_eq!(placed.items.len(), 1);
    assert_eq!(placed.items[0].price, 100);
    assert_eq!(placed.items[0].quantity, 2);

    let (stock, sold) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 1);
    assert_eq!(sold, 2);

    let cart = cart_service::list_cart(&state, &user, empty_pagination()).await?;
    assert!(cart.data.unwrap().items.is_empty());

    // The cart was consumed, so an immediate retry has nothing to order.
    let retry = order_service::place_order(&state, &user, shipping()).await;
    assert!(matches!(retry, Err(AppError::EmptyCart)));

    Ok(())
}

#[tokio::test]
async fn insufficient_stock_leaves_no_trace() -> anyhow::Result<()> {
    let Some(url) = database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run it.");
        return Ok(());
    };
    let state = setup_state(&url).await?;

    let user = create_user(&state, "user").await?;
    let product_id = create_product(&state, "Last unit", 500, 1).await?;

    // Seed the line directly: the cart cap would refuse this, but stock can
    // legitimately drop between add-to-cart and checkout.
    CartItemActive {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        product_id: Set(product_id),
        quantity: Set(2),
        created_at: NotSet,
    }
    .insert(&state.orm)
    .await?;

    let result = order_service::place_order(&state, &user, shipping()).await;
    match result {
        Err(AppError::InsufficientStock { ref name, stock }) => {
            assert!(name.starts_with("Last unit"));
            assert_eq!(stock, 1);
        }
        other => panic!("expected InsufficientStock, got {other:?}"),
    }

    // Nothing moved: no order, stock untouched, cart line still there.
    let orders = order_service::list_orders(
        &state,
        &user,
        OrderListQuery {
            pagination: empty_pagination(),
            status: None,
            sort_order: None,
        },
    )
    .await?;
    assert!(orders.data.unwrap().items.is_empty());

    let (stock, sold) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 1);
    assert_eq!(sold, 0);

    let cart = cart_service::list_cart(&state, &user, empty_pagination()).await?;
    assert_eq!(cart.data.unwrap().items.len(), 1);

    Ok(())
}

#[tokio::test]
async fn cancel_restores_stock_once() -> anyhow::Result<()> {
    let Some(url) = database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run it.");
        return Ok(());
    };
    let state = setup_state(&url).await?;

    let user = create_user(&state, "user").await?;
    let product_id = create_product(&state, "Returnable", 250, 5).await?;

    cart_service::add_to_cart(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 2,
        },
    )
    .await?;
    let resp = order_service::place_order(&state, &user, shipping()).await?;
    let order = resp.data.unwrap().order;

    let (stock, sold) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 3);
    assert_eq!(sold, 2);

    order_service::cancel_order(&state, &user, order.id).await?;

    // Stock comes back; sold_count keeps counting units ever sold.
    let (stock, sold) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 5);
    assert_eq!(sold, 2);

    let fetched = order_service::get_order(&state, &user, order.id).await?;
    assert_eq!(fetched.data.unwrap().order.status, "cancelled");

    let again = order_service::cancel_order(&state, &user, order.id).await;
    assert!(matches!(again, Err(AppError::InvalidTransition { .. })));
    let (stock, _) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 5);

    Ok(())
}

#[tokio::test]
async fn status_machine_walks_forward_and_rejects_sidesteps() -> anyhow::Result<()> {
    let Some(url) = database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run it.");
        return Ok(());
    };
    let state = setup_state(&url).await?;

    let user = create_user(&state, "user").await?;
    let admin = create_user(&state, "admin").await?;
    let product_id = create_product(&state, "Shippable", 1000, 4).await?;

    cart_service::add_to_cart(
        &state,
        &user,
        AddToCartRequest {
            product_id,
            quantity: 1,
        },
    )
    .await?;
    let order = order_service::place_order(&state, &user, shipping())
        .await?
        .data
        .unwrap()
        .order;

    // Non-admins cannot drive the machine.
    let forbidden = order_service::update_order_status(
        &state,
        &user,
        order.id,
        UpdateOrderStatusRequest {
            status: "paid".into(),
        },
    )
    .await;
    assert!(matches!(forbidden, Err(AppError::Forbidden)));

    // Unknown values are rejected before any lookup.
    let unknown = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "completed".into(),
        },
    )
    .await;
    assert!(matches!(unknown, Err(AppError::InvalidStatus)));

    // Skipping ahead is not a legal move.
    let skip = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await;
    assert!(matches!(skip, Err(AppError::InvalidTransition { .. })));

    let paid = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "paid".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(paid.status, "paid");
    assert!(paid.paid_at.is_some());

    let shipped = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "shipped".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(shipped.status, "shipped");
    assert!(shipped.shipped_at.is_some());

    // Shipped orders are past the customer cancellation window.
    let cancel = order_service::cancel_order(&state, &user, order.id).await;
    assert!(matches!(cancel, Err(AppError::InvalidTransition { .. })));
    let (stock, _) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 3);

    let delivered = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "delivered".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(delivered.status, "delivered");
    assert!(delivered.delivered_at.is_some());

    // Refund stays available as the administrative override.
    let refunded = order_service::update_order_status(
        &state,
        &admin,
        order.id,
        UpdateOrderStatusRequest {
            status: "refunded".into(),
        },
    )
    .await?
    .data
    .unwrap();
    assert_eq!(refunded.status, "refunded");

    Ok(())
}

#[tokio::test]
async fn concurrent_checkouts_cannot_oversell_the_last_unit() -> anyhow::Result<()> {
    let Some(url) = database_url() else {
        eprintln!("Skipping test: set TEST_DATABASE_URL or DATABASE_URL to run it.");
        return Ok(());
    };
    let state = setup_state(&url).await?;

    let first = create_user(&state, "user").await?;
    let second = create_user(&state, "user").await?;
    let product_id = create_product(&state, "Scarce", 900, 1).await?;

    for user in [&first, &second] {
        cart_service::add_to_cart(
            &state,
            user,
            AddToCartRequest {
                product_id,
                quantity: 1,
            },
        )
        .await?;
    }

    let (a, b) = tokio::join!(
        order_service::place_order(&state, &first, shipping()),
        order_service::place_order(&state, &second, shipping()),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one checkout may take the last unit");

    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser,
        Err(AppError::InsufficientStock { .. })
    ));

    let (stock, sold) = product_counts(&state, product_id).await?;
    assert_eq!(stock, 0);
    assert_eq!(sold, 1);

    Ok(())
}
